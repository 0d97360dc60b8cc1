//! Telegram edge: long-polling dispatcher and the `ChatTransport` impl.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{Document, InputFile, ParseMode};
use teloxide::utils::html;
use tracing::debug;

use crate::{BotCommand, BotEvent, BotService, ChatRef, ChatTransport, IncomingFile};

/// Must stay above the 10 s long-poll window teloxide uses.
const MIN_TIMEOUT_SECS: u64 = 17;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Builds a bot whose requests fail after `timeout_secs` instead of hanging.
pub fn build_bot(token: &str, timeout_secs: u64) -> anyhow::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(timeout_secs.max(MIN_TIMEOUT_SECS)))
        .build()
        .context("building telegram http client")?;
    Ok(Bot::with_client(token, client))
}

#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat: ChatRef, text: &str) -> anyhow::Result<()> {
        self.bot
            .send_message(ChatId(chat.0), text)
            .await
            .context("sending telegram message")?;
        Ok(())
    }

    async fn send_preformatted(&self, chat: ChatRef, text: &str) -> anyhow::Result<()> {
        self.bot
            .send_message(ChatId(chat.0), html::code_block(text))
            .parse_mode(ParseMode::Html)
            .await
            .context("sending telegram code block")?;
        Ok(())
    }

    async fn send_document(&self, chat: ChatRef, file_name: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.bot
            .send_document(ChatId(chat.0), InputFile::memory(bytes).file_name(file_name.to_string()))
            .await
            .context("sending telegram document")?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
        let file = self
            .bot
            .get_file(file_id)
            .await
            .context("resolving telegram file")?;
        let mut buf = Vec::new();
        self.bot
            .download_file(&file.path, &mut buf)
            .await
            .context("downloading telegram file")?;
        Ok(buf)
    }
}

/// Polls Telegram and feeds commands and document uploads to `service` until
/// the dispatcher shuts down.
pub async fn run_dispatcher(bot: Bot, service: Arc<BotService>) {
    let handler = Update::filter_message()
        .branch(Message::filter_document().endpoint(on_document))
        .branch(Message::filter_text().endpoint(on_text));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![service])
        .default_handler(|update| async move {
            debug!(update = ?update.id, "ignored update");
        })
        .build()
        .dispatch()
        .await;
}

async fn on_text(bot: Bot, msg: Message, text: String, service: Arc<BotService>) -> HandlerResult {
    let Some(command) = BotCommand::parse(&text) else {
        return Ok(());
    };
    let event = BotEvent::Command {
        chat: ChatRef(msg.chat.id.0),
        command,
    };
    service.handle(event, &TelegramTransport::new(bot)).await;
    Ok(())
}

async fn on_document(bot: Bot, msg: Message, doc: Document, service: Arc<BotService>) -> HandlerResult {
    let event = BotEvent::Document {
        chat: ChatRef(msg.chat.id.0),
        file: incoming_file(&doc),
    };
    service.handle(event, &TelegramTransport::new(bot)).await;
    Ok(())
}

fn incoming_file(doc: &Document) -> IncomingFile {
    IncomingFile {
        file_id: doc.file.id.clone(),
        file_name: doc.file_name.clone(),
        mime_type: doc.mime_type.as_ref().map(|m| m.essence_str().to_string()),
    }
}
