//! Message dispatcher: ownership, command fast path, enforcement pipeline.
//!
//! Each inbound PRIVMSG is handed to its own task so a slow control-plane
//! or moderation call never stalls the shard read loop, and a panic in one
//! message's worker is contained by the task boundary. Everything on the
//! policy path degrades to allowing the message.

use std::sync::Arc;

use tracing::{debug, warn};

use eloward_irc::{Command, Message};

use crate::cache::{ConfigCache, RankCache};
use crate::commands::CommandInterpreter;
use crate::moderation::{ModerationExecutor, ModerationOutcome};
use crate::policy::EnforcementMode;
use crate::rank::meets_minimum;
use crate::roles::{AuthorRoles, SuperAdmins};
use crate::scheduler::JoinScheduler;
use crate::shard::ShardHandle;

pub struct Dispatcher {
    config: Arc<ConfigCache>,
    ranks: Arc<RankCache>,
    scheduler: Arc<JoinScheduler>,
    executor: Arc<ModerationExecutor>,
    interpreter: Arc<CommandInterpreter>,
    admins: SuperAdmins,
    shards: Vec<ShardHandle>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ConfigCache>,
        ranks: Arc<RankCache>,
        scheduler: Arc<JoinScheduler>,
        executor: Arc<ModerationExecutor>,
        interpreter: Arc<CommandInterpreter>,
        admins: SuperAdmins,
        shards: Vec<ShardHandle>,
    ) -> Dispatcher {
        Dispatcher {
            config,
            ranks,
            scheduler,
            executor,
            interpreter,
            admins,
            shards,
        }
    }

    /// Route one inbound line received on `shard_idx`. Non-PRIVMSG traffic
    /// is ignored here; lifecycle frames are the supervisor's business.
    pub fn handle_line(self: &Arc<Self>, shard_idx: usize, msg: Message) {
        if !matches!(msg.command, Command::Privmsg(_, _)) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.process(shard_idx, msg).await;
        });
    }

    async fn process(&self, shard_idx: usize, msg: Message) {
        let Command::Privmsg(target, text) = &msg.command else {
            return;
        };
        let channel = target.trim_start_matches('#').to_ascii_lowercase();
        let Some(author) = msg.source_nickname().map(str::to_ascii_lowercase) else {
            return;
        };

        // Ownership: only the shard carrying a channel reacts to its
        // messages, so a brief handover cannot produce duplicate replies or
        // duplicate timeouts.
        match self.scheduler.owner(&channel) {
            Some(owner) if owner == shard_idx => {}
            owner => {
                debug!(
                    channel = %channel,
                    shard = shard_idx,
                    owner = ?owner,
                    "dropping message on non-owner shard"
                );
                return;
            }
        }

        if CommandInterpreter::is_command(text) {
            let roles = AuthorRoles::resolve(&msg, &channel, &author);
            let text = text.clone();
            if let Some(reply) = self
                .interpreter
                .handle(&channel, &author, &roles, &text)
                .await
            {
                self.shards[shard_idx].say(&channel, &reply).await;
            }
            return;
        }

        self.enforce(&channel, &author, &msg).await;
    }

    /// The policy path: config → role → rank → decision.
    async fn enforce(&self, channel: &str, author: &str, msg: &Message) {
        let Some(policy) = self.config.get(channel).await else {
            return;
        };
        if !policy.enabled {
            // Standby: joined, receiving, not enforcing.
            return;
        }

        let roles = AuthorRoles::resolve(msg, channel, author);
        if self.admins.contains(author) || roles.is_exempt() {
            // No rank lookup for exempt authors.
            return;
        }

        let standing = self.ranks.get(author).await;
        let violation = match policy.mode {
            EnforcementMode::HasRank => !standing.present,
            EnforcementMode::MinRank => {
                !standing.present
                    || !meets_minimum(standing.rank.as_ref(), policy.min_rank().as_ref())
            }
        };
        if !violation {
            return;
        }

        match self.executor.execute(channel, author, &roles, &policy).await {
            Ok(ModerationOutcome::TimedOut { duration }) => {
                debug!(channel = %channel, user = %author, duration = duration, "enforcement complete");
            }
            Ok(outcome) => {
                debug!(channel = %channel, user = %author, outcome = ?outcome, "enforcement skipped");
            }
            Err(e) => {
                // Never retried; the next offending message triggers again.
                warn!(channel = %channel, user = %author, error = %e, "timeout attempt failed");
            }
        }
    }
}
