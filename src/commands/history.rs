//! Presence transition history command.
//!
//! Prints the most recent transitions recorded for a user, optionally pruning
//! entries older than the configured retention first.

use crate::db::transitions::{TransitionStore, Transitions};
use crate::libs::config::Config;
use crate::libs::messages::Message;
use crate::libs::view::View;
use crate::{msg_bail_anyhow, msg_info, msg_print, msg_success};
use anyhow::Result;
use chrono::{Duration, Utc};
use clap::Args;

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// User to show; defaults to the configured watch user
    #[arg(short, long)]
    user: Option<String>,

    /// Number of most recent transitions to show
    #[arg(short, long, default_value_t = 20)]
    limit: usize,

    /// Delete transitions older than the configured retention first
    #[arg(long)]
    prune: bool,
}

pub fn cmd(args: HistoryArgs) -> Result<()> {
    if args.limit == 0 {
        msg_bail_anyhow!(Message::InvalidHistoryLimit);
    }
    let config = Config::read()?;
    let user_id = args.user.unwrap_or_else(|| config.watch_or_default().user_id);
    let transitions = Transitions::new()?;

    if args.prune {
        let days = config.presence_or_default().fusion.history_retention_days.max(0);
        let removed = transitions.prune_older_than(Utc::now() - Duration::days(days))?;
        msg_success!(Message::HistoryPruned(removed));
    }

    let records = transitions.history(&user_id, args.limit)?;
    if records.is_empty() {
        msg_info!(Message::NoTransitionsFound(user_id));
        return Ok(());
    }

    msg_print!(Message::HistoryHeader(user_id), true);
    View::transitions(&records)?;
    Ok(())
}
