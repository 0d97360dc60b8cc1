//! Chat command dispatcher for INSERA: ticket lookup, spreadsheet ingest, and
//! exports, behind a transport seam so Telegram stays at the edge.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use insera_core::query::NOT_FOUND;
use insera_core::{format_reply, search, SearchResult};
use insera_storage::{fingerprint, TableStore, EXPORT_FILE_NAME, XLSX_MIME};
use thiserror::Error;
use tracing::{info, warn};

pub mod telegram;

pub use telegram::{build_bot, run_dispatcher, TelegramTransport};

pub const CRATE_NAME: &str = "insera-bot";

pub const GREETING: &str =
    "Halo ges! Silahkan gunakan perintah /cekcek beserta No Tiket atau No Internet. Cth. /cekcek INC2121212";
pub const INGEST_OK: &str = "Data diterima dan diperbaharui, cihuy!";
pub const INGEST_WRONG_FORMAT: &str = "Formatnya salah kocak!!";
pub const INGEST_FAILED: &str = "Filenya gak kebaca, data tidak diubah.";
pub const EXPORT_OK: &str = "Ini ges data terbarunya";
pub const EXPORT_FAILED: &str = "Gagal bikin file data, coba lagi nanti.";
pub const REQUEST_FAILED: &str = "Waduh, lagi error nih. Coba lagi nanti ya.";
pub const EXPORT_REFUSED: &str = "Eh! elu siapeh! cuman pembuat yang bisa kocak. Sungkem dulu gih!";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct BotConfig {
    pub token: String,
    pub admin_chat: ChatRef,
    pub dataset_url: String,
    pub open_export: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"<redacted>")
            .field("admin_chat", &self.admin_chat)
            .field("dataset_url", &self.dataset_url)
            .field("open_export", &self.open_export)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let admin_raw = required("INSERA_ADMIN_CHAT_ID")?;
        let admin_chat = admin_raw
            .trim()
            .parse()
            .map(ChatRef)
            .map_err(|_| ConfigError::Invalid {
                name: "INSERA_ADMIN_CHAT_ID",
                value: admin_raw.clone(),
            })?;

        Ok(Self {
            token: required("TELEGRAM_BOT_TOKEN")?,
            admin_chat,
            dataset_url: required("INSERA_DATASET_URL")?,
            open_export: lookup("INSERA_OPEN_EXPORT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            http_timeout_secs: lookup("INSERA_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: lookup("INSERA_USER_AGENT").unwrap_or_else(|| "insera-bot/0.1".to_string()),
        })
    }
}

/// Conversation identity as issued by the chat platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatRef(pub i64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Cekcek(String),
    /// Export restricted to the admin chat.
    KenkenDownload,
    /// Export to the requesting chat; open to everyone only when enabled.
    DownloadinYaah,
}

impl BotCommand {
    /// Parses `/word[@botname] [args]`. Command words match case-insensitively.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim_start();
        let rest = text.strip_prefix('/')?;
        let (word, args) = match rest.find(char::is_whitespace) {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let word = word.split('@').next().unwrap_or(word).to_ascii_lowercase();
        match word.as_str() {
            "start" => Some(Self::Start),
            "cekcek" => Some(Self::Cekcek(args.trim().to_string())),
            "kenkendownload" => Some(Self::KenkenDownload),
            "downloadinyaah" => Some(Self::DownloadinYaah),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    Command { chat: ChatRef, command: BotCommand },
    Document { chat: ChatRef, file: IncomingFile },
}

impl BotEvent {
    pub fn chat(&self) -> ChatRef {
        match self {
            BotEvent::Command { chat, .. } | BotEvent::Document { chat, .. } => *chat,
        }
    }

    /// Text sent when handling this event fails after the fact.
    fn failure_reply(&self) -> &'static str {
        match self {
            BotEvent::Command {
                command: BotCommand::KenkenDownload | BotCommand::DownloadinYaah,
                ..
            } => EXPORT_FAILED,
            BotEvent::Document { .. } => INGEST_FAILED,
            BotEvent::Command { .. } => REQUEST_FAILED,
        }
    }
}

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat: ChatRef, text: &str) -> anyhow::Result<()>;

    /// Sends `text` as one verbatim, copyable block.
    async fn send_preformatted(&self, chat: ChatRef, text: &str) -> anyhow::Result<()>;

    async fn send_document(&self, chat: ChatRef, file_name: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct BotService {
    store: Arc<TableStore>,
    admin_chat: ChatRef,
    open_export: bool,
}

impl BotService {
    pub fn new(store: Arc<TableStore>, admin_chat: ChatRef, open_export: bool) -> Self {
        Self {
            store,
            admin_chat,
            open_export,
        }
    }

    pub fn admin_chat(&self) -> ChatRef {
        self.admin_chat
    }

    /// Routes one inbound event. Failures are logged and answered with a
    /// fallback text; they never escape.
    pub async fn handle(&self, event: BotEvent, transport: &dyn ChatTransport) {
        let chat = event.chat();
        let fallback = event.failure_reply();
        let result = match event {
            BotEvent::Command { command, .. } => match command {
                BotCommand::Start => self.greet(chat, transport).await,
                BotCommand::Cekcek(term) => self.query(chat, &term, transport).await,
                BotCommand::KenkenDownload => self.privileged_export(chat, transport).await,
                BotCommand::DownloadinYaah if self.open_export => self.export(chat, transport).await,
                BotCommand::DownloadinYaah => self.privileged_export(chat, transport).await,
            },
            BotEvent::Document { file, .. } => self.ingest(chat, &file, transport).await,
        };
        if let Err(err) = result {
            warn!(chat = chat.0, error = %format!("{err:#}"), "chat event failed");
            if let Err(reply_err) = transport.send_text(chat, fallback).await {
                warn!(chat = chat.0, error = %format!("{reply_err:#}"), "fallback reply failed");
            }
        }
    }

    async fn greet(&self, chat: ChatRef, transport: &dyn ChatTransport) -> anyhow::Result<()> {
        info!(chat = chat.0, "greeting");
        transport.send_text(chat, GREETING).await
    }

    async fn query(&self, chat: ChatRef, term: &str, transport: &dyn ChatTransport) -> anyhow::Result<()> {
        let table = self.store.snapshot().await;
        let result = search(&table, term);
        if matches!(result, SearchResult::EmptyTerm) {
            info!(chat = chat.0, "empty query");
            return transport.send_text(chat, NOT_FOUND).await;
        }
        info!(
            chat = chat.0,
            term,
            matches = result.records().len(),
            matched_by = ?result.matched_by(),
            "query"
        );
        let reply = format_reply(result.records(), table.date_range());
        transport.send_preformatted(chat, &reply).await
    }

    async fn ingest(&self, chat: ChatRef, file: &IncomingFile, transport: &dyn ChatTransport) -> anyhow::Result<()> {
        let is_xlsx = file
            .mime_type
            .as_deref()
            .is_some_and(|mime| mime.eq_ignore_ascii_case(XLSX_MIME));
        if !is_xlsx {
            info!(chat = chat.0, mime = ?file.mime_type, "rejected upload format");
            return transport.send_text(chat, INGEST_WRONG_FORMAT).await;
        }

        let incoming = match read_upload(file, transport).await {
            Ok(table) => table,
            Err(err) => {
                warn!(chat = chat.0, file = ?file.file_name, error = %format!("{err:#}"), "upload rejected");
                return transport.send_text(chat, INGEST_FAILED).await;
            }
        };

        let summary = self.store.ingest(incoming).await;
        info!(
            chat = chat.0,
            file = ?file.file_name,
            added = summary.added,
            skipped = summary.skipped,
            total = summary.total,
            "upload merged"
        );
        transport.send_text(chat, INGEST_OK).await
    }

    async fn privileged_export(&self, chat: ChatRef, transport: &dyn ChatTransport) -> anyhow::Result<()> {
        if chat != self.admin_chat {
            warn!(chat = chat.0, "export refused");
            return transport.send_text(chat, EXPORT_REFUSED).await;
        }
        self.export(chat, transport).await
    }

    /// Sends the whole table as a workbook to `chat`, then a confirmation.
    pub async fn export(&self, chat: ChatRef, transport: &dyn ChatTransport) -> anyhow::Result<()> {
        let table = self.store.snapshot().await;
        let records = table.len();
        let encoded = tokio::task::spawn_blocking(move || insera_storage::encode(&table))
            .await
            .context("joining export encoder")?;
        let bytes = encoded.context("encoding export workbook")?;

        let size = bytes.len();
        transport
            .send_document(chat, EXPORT_FILE_NAME, bytes)
            .await
            .context("sending export workbook")?;
        transport.send_text(chat, EXPORT_OK).await?;
        info!(chat = chat.0, records, bytes = size, "export sent");
        Ok(())
    }
}

async fn read_upload(file: &IncomingFile, transport: &dyn ChatTransport) -> anyhow::Result<insera_core::Table> {
    let bytes = transport
        .download_file(&file.file_id)
        .await
        .context("downloading upload")?;
    info!(bytes = bytes.len(), sha256 = %fingerprint(&bytes), "upload downloaded");
    tokio::task::spawn_blocking(move || insera_storage::decode(&bytes))
        .await
        .context("joining upload decoder")?
        .context("decoding upload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::NaiveDate;
    use insera_core::{Record, Table};

    const ADMIN: ChatRef = ChatRef(247590309);
    const STRANGER: ChatRef = ChatRef(1111);

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(ChatRef, String),
        Pre(ChatRef, String),
        Document(ChatRef, String, Vec<u8>),
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Sent>>,
        files: HashMap<String, Vec<u8>>,
        reject_documents: bool,
    }

    impl RecordingTransport {
        fn with_file(file_id: &str, bytes: Vec<u8>) -> Self {
            Self {
                files: HashMap::from([(file_id.to_string(), bytes)]),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_text(&self, chat: ChatRef, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(Sent::Text(chat, text.to_string()));
            Ok(())
        }

        async fn send_preformatted(&self, chat: ChatRef, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(Sent::Pre(chat, text.to_string()));
            Ok(())
        }

        async fn send_document(&self, chat: ChatRef, file_name: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
            if self.reject_documents {
                anyhow::bail!("Request Entity Too Large");
            }
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Document(chat, file_name.to_string(), bytes));
            Ok(())
        }

        async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
            self.files
                .get(file_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown file {file_id}"))
        }
    }

    fn scenario_record() -> Record {
        Record {
            incident: "INC1000".into(),
            workzone: "BDK".into(),
            service_no: "81234567".into(),
            reported_date: NaiveDate::from_ymd_opt(2024, 1, 5).and_then(|d| d.and_hms_opt(0, 0, 0)),
            ttr_customer: Some(2.0),
            summary: "gangguan massal".into(),
            ..Record::default()
        }
    }

    fn service(open_export: bool) -> (BotService, Arc<TableStore>) {
        let store = Arc::new(TableStore::new(Table::new(vec![scenario_record()])));
        (BotService::new(store.clone(), ADMIN, open_export), store)
    }

    fn command(chat: ChatRef, text: &str) -> BotEvent {
        BotEvent::Command {
            chat,
            command: BotCommand::parse(text).expect("known command"),
        }
    }

    fn upload(chat: ChatRef, mime: &str) -> BotEvent {
        BotEvent::Document {
            chat,
            file: IncomingFile {
                file_id: "file-1".into(),
                file_name: Some("batch.xlsx".into()),
                mime_type: Some(mime.into()),
            },
        }
    }

    #[test]
    fn parses_commands_with_bot_suffix_and_args() {
        assert_eq!(BotCommand::parse("/start"), Some(BotCommand::Start));
        assert_eq!(
            BotCommand::parse("/cekcek@insera_bot   INC  1000 "),
            Some(BotCommand::Cekcek("INC  1000".into()))
        );
        assert_eq!(BotCommand::parse("/cekcek"), Some(BotCommand::Cekcek(String::new())));
        assert_eq!(BotCommand::parse("/DownloadinYaah"), Some(BotCommand::DownloadinYaah));
        assert_eq!(BotCommand::parse("/kenkendownload"), Some(BotCommand::KenkenDownload));
        assert_eq!(BotCommand::parse("/unknown"), None);
        assert_eq!(BotCommand::parse("cekcek INC1"), None);
    }

    #[test]
    fn config_requires_token_admin_and_url() {
        let env = HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("INSERA_ADMIN_CHAT_ID", "247590309"),
            ("INSERA_DATASET_URL", "https://example.invalid/data.xlsx"),
        ]);
        let config = BotConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).expect("config");
        assert_eq!(config.admin_chat, ADMIN);
        assert!(!config.open_export);
        assert_eq!(config.http_timeout_secs, 20);
        assert!(!format!("{config:?}").contains("123:abc"));

        let err = BotConfig::from_lookup(|k| {
            (k != "TELEGRAM_BOT_TOKEN").then(|| env.get(k).map(|v| v.to_string())).flatten()
        })
        .expect_err("token missing");
        assert!(matches!(err, ConfigError::Missing("TELEGRAM_BOT_TOKEN")));

        let err = BotConfig::from_lookup(|k| match k {
            "INSERA_ADMIN_CHAT_ID" => Some("not-a-number".into()),
            _ => env.get(k).map(|v| v.to_string()),
        })
        .expect_err("admin id invalid");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[tokio::test]
    async fn start_replies_with_usage() {
        let (svc, _) = service(false);
        let transport = RecordingTransport::default();
        svc.handle(command(STRANGER, "/start"), &transport).await;
        assert_eq!(transport.sent(), vec![Sent::Text(STRANGER, GREETING.into())]);
    }

    #[tokio::test]
    async fn query_replies_with_one_preformatted_block() {
        let (svc, _) = service(false);
        let transport = RecordingTransport::default();
        svc.handle(command(STRANGER, "/cekcek 81234567"), &transport).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let Sent::Pre(chat, body) = &sent[0] else {
            panic!("expected preformatted reply, got {sent:?}");
        };
        assert_eq!(*chat, STRANGER);
        assert!(body.starts_with("Data tiket dari tgl:\n2024-01-05 s/d 2024-01-05\n\n"));
        assert!(body.contains("INC1000 BDK"));
        assert!(body.ends_with("gangguan massal"));
    }

    #[tokio::test]
    async fn blank_query_is_plain_not_found() {
        let (svc, _) = service(false);
        let transport = RecordingTransport::default();
        svc.handle(command(STRANGER, "/cekcek   "), &transport).await;
        assert_eq!(transport.sent(), vec![Sent::Text(STRANGER, NOT_FOUND.into())]);
    }

    #[tokio::test]
    async fn privileged_export_only_for_admin() {
        let (svc, _) = service(false);

        let admin = RecordingTransport::default();
        svc.handle(command(ADMIN, "/kenkendownload"), &admin).await;
        let sent = admin.sent();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            Sent::Document(chat, name, bytes) => {
                assert_eq!(*chat, ADMIN);
                assert_eq!(name, EXPORT_FILE_NAME);
                let table = insera_storage::decode(bytes).expect("export decodes");
                assert_eq!(table.records(), &[scenario_record()]);
            }
            other => panic!("expected document first, got {other:?}"),
        }
        assert_eq!(sent[1], Sent::Text(ADMIN, EXPORT_OK.into()));

        let stranger = RecordingTransport::default();
        svc.handle(command(STRANGER, "/kenkendownload"), &stranger).await;
        assert_eq!(stranger.sent(), vec![Sent::Text(STRANGER, EXPORT_REFUSED.into())]);
    }

    #[tokio::test]
    async fn failed_export_delivery_still_answers_the_requester() {
        let (service, _) = service(false);
        let transport = RecordingTransport {
            reject_documents: true,
            ..RecordingTransport::default()
        };

        service.handle(command(ADMIN, "/kenkendownload"), &transport).await;

        assert_eq!(transport.sent(), vec![Sent::Text(ADMIN, EXPORT_FAILED.into())]);
    }

    #[tokio::test]
    async fn open_export_follows_configuration() {
        let (restricted, _) = service(false);
        let transport = RecordingTransport::default();
        restricted.handle(command(STRANGER, "/DownloadinYaah"), &transport).await;
        assert_eq!(transport.sent(), vec![Sent::Text(STRANGER, EXPORT_REFUSED.into())]);

        let (open, _) = service(true);
        let transport = RecordingTransport::default();
        open.handle(command(STRANGER, "/DownloadinYaah"), &transport).await;
        let sent = transport.sent();
        assert!(matches!(&sent[0], Sent::Document(chat, _, _) if *chat == STRANGER));
        assert_eq!(sent[1], Sent::Text(STRANGER, EXPORT_OK.into()));
    }

    #[tokio::test]
    async fn upload_merges_and_keeps_first_occurrence() {
        let mut changed = scenario_record();
        changed.ttr_customer = Some(48.0);
        let mut fresh = scenario_record();
        fresh.incident = "INC2000".into();
        let bytes = insera_storage::encode(&Table::new(vec![changed, fresh])).expect("encode");

        let (svc, store) = service(false);
        let transport = RecordingTransport::with_file("file-1", bytes);
        svc.handle(upload(STRANGER, XLSX_MIME), &transport).await;

        assert_eq!(transport.sent(), vec![Sent::Text(STRANGER, INGEST_OK.into())]);
        let table = store.snapshot().await;
        assert_eq!(table.len(), 2);
        let inc1000: Vec<_> = table.records().iter().filter(|r| r.incident == "INC1000").collect();
        assert_eq!(inc1000, vec![&scenario_record()]);
    }

    #[tokio::test]
    async fn upload_with_wrong_mime_is_rejected() {
        let (svc, store) = service(false);
        let transport = RecordingTransport::default();
        svc.handle(upload(STRANGER, "text/csv"), &transport).await;
        assert_eq!(transport.sent(), vec![Sent::Text(STRANGER, INGEST_WRONG_FORMAT.into())]);
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_upload_leaves_table_unchanged() {
        let (svc, store) = service(false);
        let transport = RecordingTransport::with_file("file-1", b"not a workbook".to_vec());
        svc.handle(upload(STRANGER, XLSX_MIME), &transport).await;
        assert_eq!(transport.sent(), vec![Sent::Text(STRANGER, INGEST_FAILED.into())]);
        assert_eq!(store.snapshot().await.records(), &[scenario_record()]);
    }
}
