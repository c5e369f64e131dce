//! Telegram bot adapter: command short-circuits, the envelope pipeline,
//! and HTML reply formatting.

use crate::channels::{APOLOGY, ChannelRuntime};
use crate::config::TelegramConfig;
use crate::envelope::ChannelKind;
use crate::notify::NotificationSink;
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use teloxide::prelude::*;
use teloxide::types::{Message as TgMessage, Update};
use tracing::{info, warn};

const START_REPLY: &str = "안녕하세요! Adjutant 개인 AI 비서입니다.\n메시지를 보내주세요. 무엇이든 도와드리겠습니다.";
const HELP_REPLY: &str = "사용법:\n- 일반 메시지를 보내면 AI가 답변합니다.\n- /start - 시작 인사\n- /help - 도움말";

static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:\w*\n)?(.*?)```").expect("fenced code pattern"));
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("inline code pattern"));
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold pattern"));
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*]+)\*").expect("italic pattern"));

/// Convert assistant markdown to Telegram HTML. Pass order matters:
/// escape first, then fenced code, inline code, bold, italic.
pub fn markdown_to_telegram_html(text: &str) -> String {
    let escaped = text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;");
    let html = FENCED_CODE.replace_all(&escaped, "<pre>$1</pre>");
    let html = INLINE_CODE.replace_all(&html, "<code>$1</code>");
    let html = BOLD.replace_all(&html, "<b>$1</b>");
    let html = ITALIC.replace_all(&html, "<i>$1</i>");
    html.into_owned()
}

pub struct TelegramChannel {
    config: TelegramConfig,
    bot: Bot,
    runtime: Arc<ChannelRuntime>,
    /// Chat ids that have conversed recently; the notification fan-out
    /// reaches these.
    recent_chats: Arc<Mutex<HashSet<String>>>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, runtime: Arc<ChannelRuntime>) -> Self {
        let bot = Bot::new(&config.token);
        Self {
            config,
            bot,
            runtime,
            recent_chats: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Notification sink covering this bot's recent chats.
    pub fn notification_sink(&self) -> Arc<dyn NotificationSink> {
        Arc::new(TelegramSink {
            bot: self.bot.clone(),
            recent_chats: self.recent_chats.clone(),
        })
    }

    /// Start the long-polling dispatcher on its own task.
    pub async fn start(&self) -> Result<()> {
        info!("starting telegram dispatcher");
        let bot = self.bot.clone();
        let runtime = self.runtime.clone();
        let allow_from = self.config.allow_from.clone();
        let recent_chats = self.recent_chats.clone();

        let handler = Update::filter_message().endpoint(move |bot: Bot, msg: TgMessage| {
            let runtime = runtime.clone();
            let allow_from = allow_from.clone();
            let recent_chats = recent_chats.clone();
            async move {
                handle_message(bot, msg, runtime, allow_from, recent_chats).await;
                Ok::<(), anyhow::Error>(())
            }
        });

        let mut dispatcher = Dispatcher::builder(bot, handler).build();
        tokio::spawn(async move {
            dispatcher.dispatch().await;
        });
        info!("telegram channel started");
        Ok(())
    }
}

async fn handle_message(
    bot: Bot,
    msg: TgMessage,
    runtime: Arc<ChannelRuntime>,
    allow_from: Vec<String>,
    recent_chats: Arc<Mutex<HashSet<String>>>,
) {
    let Some(text) = msg.text() else {
        return;
    };
    let Some(user) = msg.from() else {
        return;
    };
    let sender_id = user.id.to_string();
    let chat_id = msg.chat.id;

    if !allow_from.is_empty() && !allow_from.iter().any(|a| a.trim_start_matches('+') == sender_id) {
        return;
    }

    // command short-circuits
    match text.trim() {
        "/start" => {
            let _ = bot.send_message(chat_id, START_REPLY).await;
            return;
        }
        "/help" => {
            let _ = bot.send_message(chat_id, HELP_REPLY).await;
            return;
        }
        _ => {}
    }

    recent_chats
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(chat_id.to_string());

    let user_name = user.first_name.clone();
    let mut envelope = runtime.receive(
        ChannelKind::Telegram,
        &sender_id,
        &user_name,
        text,
        HashMap::from([("platform".to_string(), "telegram".to_string())]),
    );

    let reply = match runtime.process(&mut envelope).await {
        Ok(response) => markdown_to_telegram_html(&response),
        Err(e) => {
            warn!(user_id = %sender_id, error = %e, "telegram turn failed");
            APOLOGY.to_string()
        }
    };

    if let Err(e) = bot
        .send_message(chat_id, &reply)
        .parse_mode(teloxide::types::ParseMode::Html)
        .await
    {
        warn!(error = %e, "telegram reply failed");
    }
}

struct TelegramSink {
    bot: Bot,
    recent_chats: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn label(&self) -> String {
        "telegram".to_string()
    }

    async fn deliver(&self, _event: &str, message: &str) -> Result<()> {
        let chats: Vec<String> = {
            let guard = self
                .recent_chats
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.iter().cloned().collect()
        };
        for chat in chats {
            if let Ok(id) = chat.parse::<i64>() {
                // per-chat failures are absorbed; other chats still get it
                if let Err(e) = self.bot.send_message(ChatId(id), message).await {
                    warn!(chat, error = %e, "telegram notification failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_before_formatting() {
        assert_eq!(markdown_to_telegram_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }

    #[test]
    fn fenced_code_becomes_pre() {
        let html = markdown_to_telegram_html("before ```python\nprint(1)\n``` after");
        assert!(html.contains("<pre>print(1)\n</pre>"), "{}", html);
    }

    #[test]
    fn inline_code_bold_and_italic() {
        assert_eq!(markdown_to_telegram_html("`x = 1`"), "<code>x = 1</code>");
        assert_eq!(markdown_to_telegram_html("**bold** and *lean*"), "<b>bold</b> and <i>lean</i>");
    }

    #[test]
    fn bold_runs_before_italic() {
        // double asterisks must not be eaten by the italic pass
        let html = markdown_to_telegram_html("**strong**");
        assert_eq!(html, "<b>strong</b>");
    }
}
