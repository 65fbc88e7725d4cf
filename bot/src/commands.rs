/// Group chat command grammar and dispatcher.
///
/// Handles the admin enable/disable toggles, help, and the fetch command.
/// Fetch jobs are spawned and never awaited by the dispatcher, so a long
/// download does not hold up the next inbound event.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use jm_shared::errors::{BotError, BotResult};
use jm_shared::gateway_protocol::GroupMessage;
use jm_shared::group_state::{format_remaining, CooldownTable, GroupRegistry};
use jm_shared::job::JobOutcome;

use crate::config::GrammarConfig;
use crate::gateway::GatewayApi;
use crate::pipeline::JobPipeline;

// ====== GRAMMAR ======

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enable,
    Disable,
    Help,
    /// Fetch the content with this numeric id.
    Fetch(String),
}

pub struct CommandGrammar {
    phrases: GrammarConfig,
    fetch: Regex,
}

impl CommandGrammar {
    pub fn new(phrases: GrammarConfig) -> BotResult<Self> {
        let pattern = format!(r"^{}\s+(\d+)", regex::escape(&phrases.fetch_prefix));
        let fetch = Regex::new(&pattern)
            .map_err(|e| BotError::Config(format!("fetch command pattern: {}", e)))?;
        Ok(Self { phrases, fetch })
    }

    /// Toggles and help must match the whole message; the fetch command only
    /// needs to start the message.
    pub fn parse(&self, text: &str) -> Option<Command> {
        let text = text.trim();
        if text == self.phrases.enable_phrase {
            return Some(Command::Enable);
        }
        if text == self.phrases.disable_phrase {
            return Some(Command::Disable);
        }
        if text == self.phrases.help_phrase {
            return Some(Command::Help);
        }
        self.fetch
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|id| Command::Fetch(id.as_str().to_string()))
    }

    pub fn help_text(&self, is_admin: bool) -> String {
        let mut text = format!(
            "可用命令：\n{} <JM号> - 下载指定JM号的漫画\n{} - 显示此帮助信息",
            self.phrases.fetch_prefix, self.phrases.help_phrase
        );
        if is_admin {
            text.push_str(&format!(
                "\n管理员命令：\n{} - 在本群启用JM下载功能\n{} - 在本群禁用JM下载功能",
                self.phrases.enable_phrase, self.phrases.disable_phrase
            ));
        }
        text
    }
}

// ====== DISPATCHER ======

/// What the dispatcher did with one event.
#[derive(Debug)]
pub enum DispatchOutcome {
    Ignored,
    Replied,
    /// Fetch refused; seconds until the group may fetch again.
    CoolingDown(u64),
    /// Fetch accepted and running in the background.
    JobStarted(JoinHandle<JobOutcome>),
}

pub struct CommandDispatcher {
    gateway: Arc<dyn GatewayApi>,
    groups: GroupRegistry,
    cooldowns: CooldownTable,
    pipeline: Arc<JobPipeline>,
    grammar: CommandGrammar,
    admins: HashSet<i64>,
}

impl CommandDispatcher {
    pub fn new(
        gateway: Arc<dyn GatewayApi>,
        groups: GroupRegistry,
        cooldowns: CooldownTable,
        pipeline: Arc<JobPipeline>,
        grammar: CommandGrammar,
        admins: HashSet<i64>,
    ) -> Self {
        Self {
            gateway,
            groups,
            cooldowns,
            pipeline,
            grammar,
            admins,
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    /// Handle events in arrival order until the channel closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<Value>) {
        info!("Command dispatcher started");
        while let Some(event) = events.recv().await {
            self.handle_event(&event).await;
        }
        info!("Event stream closed, dispatcher stopping");
    }

    pub async fn handle_event(&self, event: &Value) -> DispatchOutcome {
        let Some(msg) = GroupMessage::from_event(event) else {
            debug!("Ignoring non-group event");
            return DispatchOutcome::Ignored;
        };
        debug!("Group {} user {}: {}", msg.group_id, msg.user_id, msg.text);

        match self.grammar.parse(&msg.text) {
            Some(Command::Enable) => self.toggle(&msg, true).await,
            Some(Command::Disable) => self.toggle(&msg, false).await,
            Some(Command::Help) => {
                let help = self.grammar.help_text(self.is_admin(msg.user_id));
                self.gateway.send_group_text(msg.group_id, &help).await;
                DispatchOutcome::Replied
            }
            Some(Command::Fetch(content_id)) => self.fetch(&msg, content_id).await,
            None => DispatchOutcome::Ignored,
        }
    }

    async fn toggle(&self, msg: &GroupMessage, enable: bool) -> DispatchOutcome {
        if !self.is_admin(msg.user_id) {
            info!("User {} tried to toggle group {} without permission", msg.user_id, msg.group_id);
            self.gateway
                .send_group_text(msg.group_id, "抱歉，您没有权限执行此命令。")
                .await;
            return DispatchOutcome::Replied;
        }

        let reply = match (enable, enable_or_disable(&self.groups, msg.group_id, enable).await) {
            (true, true) => "已在本群启用JM下载功能。",
            (true, false) => "本群已启用JM下载功能。",
            (false, true) => "已在本群禁用JM下载功能。",
            (false, false) => "本群未启用JM下载功能。",
        };
        self.gateway.send_group_text(msg.group_id, reply).await;
        DispatchOutcome::Replied
    }

    async fn fetch(&self, msg: &GroupMessage, content_id: String) -> DispatchOutcome {
        if !self.groups.is_enabled(msg.group_id).await {
            debug!("Group {} is not enabled, ignoring fetch", msg.group_id);
            return DispatchOutcome::Ignored;
        }

        let remaining = self.cooldowns.remaining(msg.group_id, Utc::now()).await;
        if remaining > 0 {
            let wait = format_remaining(remaining);
            info!("Group {} cooling down, {} left", msg.group_id, wait);
            self.gateway
                .send_group_text(
                    msg.group_id,
                    &format!("本群需要等待 {} 后才能再次下载。", wait),
                )
                .await;
            return DispatchOutcome::CoolingDown(remaining);
        }

        info!(
            "Fetch of {} requested by user {} in group {}",
            content_id, msg.user_id, msg.group_id
        );
        self.gateway
            .send_group_text(msg.group_id, &format!("正在发送JM{}，请稍候...", content_id))
            .await;

        let job = self.pipeline.create_job(&content_id, msg.user_id, msg.group_id);
        let pipeline = self.pipeline.clone();
        DispatchOutcome::JobStarted(tokio::spawn(async move { pipeline.run(job).await }))
    }
}

async fn enable_or_disable(groups: &GroupRegistry, group_id: i64, enable: bool) -> bool {
    if enable {
        groups.enable(group_id).await
    } else {
        groups.disable(group_id).await
    }
}
