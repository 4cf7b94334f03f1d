//! Live presence monitoring command.
//!
//! Monitors the local user until interrupted, printing every presence
//! transition as it happens. Interaction kinds typed on stdin (`message`,
//! `typing`, `blur`, ...) are recorded as if a client had sent them, which is
//! handy for trying out thresholds.

use crate::db::patterns::Patterns;
use crate::db::transitions::Transitions;
use crate::libs::clock::SystemClock;
use crate::libs::config::Config;
use crate::libs::messages::Message;
use crate::libs::orchestrator::PresenceOrchestrator;
use crate::libs::presence::sources_to_string;
use crate::libs::probe::{SignalProbe, SystemProbe};
use crate::libs::session::InteractionKind;
use crate::libs::view::View;
use crate::{msg_error, msg_info, msg_print, msg_warning};
use anyhow::Result;
use chrono::Local;
use clap::Args;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// User to monitor; defaults to the configured watch user
    #[arg(short, long)]
    user: Option<String>,

    /// Session id; defaults to one derived from the start time
    #[arg(short, long)]
    session: Option<String>,

    /// Do not sample CPU and network activity
    #[arg(long)]
    no_probe: bool,
}

pub async fn cmd(args: WatchArgs) -> Result<()> {
    let config = Config::read()?;
    let watch = config.watch_or_default();
    let presence = config.presence_or_default();

    let user_id = args.user.unwrap_or(watch.user_id);
    let session_id = args
        .session
        .unwrap_or_else(|| format!("{}-{}", user_id, Local::now().format("%Y%m%d%H%M%S")));

    let probes: Vec<Arc<dyn SignalProbe>> = if watch.system_probe && !args.no_probe {
        vec![Arc::new(SystemProbe::new())]
    } else {
        Vec::new()
    };

    let orchestrator = PresenceOrchestrator::with_probes(presence, Arc::new(SystemClock), Arc::new(Transitions::new()?), probes)
        .with_pattern_store(Arc::new(Patterns::new()?));

    orchestrator.on_transition(&user_id, |transition| {
        msg_print!(Message::TransitionLine(
            transition.timestamp.with_timezone(&Local).format("%H:%M:%S").to_string(),
            transition.from_state.to_string(),
            transition.to_state.to_string(),
            transition.context.to_string(),
            transition.confidence,
            sources_to_string(&transition.contributing_sources),
        ));
    })?;

    orchestrator.start_monitoring(&user_id, &session_id)?;
    msg_info!(Message::WatchStarted(user_id.clone(), session_id));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => record_line(&orchestrator, &user_id, line.trim()),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    msg_warning!(Message::StdinReadFailed(e.to_string()));
                    stdin_open = false;
                }
            },
        }
    }

    msg_info!(Message::WatchStopping);
    if let Some(record) = orchestrator.stop_monitoring(&user_id).await {
        View::presence(&record)?;
    }
    if let Err(e) = orchestrator.prune_history() {
        msg_warning!(Message::HistoryPruneFailed(e.to_string()));
    }
    Ok(())
}

fn record_line(orchestrator: &PresenceOrchestrator, user_id: &str, line: &str) {
    if line.is_empty() {
        return;
    }
    if line == "status" {
        if let Some(record) = orchestrator.get_unified_presence(user_id) {
            if let Err(e) = View::presence(&record) {
                msg_warning!(Message::StatusRenderFailed(e.to_string()));
            }
        }
        if let Some(prediction) = orchestrator.idle_monitor().predict_next_break(user_id) {
            msg_print!(Message::NextBreakPrediction(prediction.eta_minutes, prediction.probability));
        }
        return;
    }

    let recorded = line
        .parse::<InteractionKind>()
        .and_then(|kind| orchestrator.record_interaction(user_id, kind, None));
    if let Err(e) = recorded {
        msg_error!(Message::InvalidInteraction(e.to_string()));
    }
}
