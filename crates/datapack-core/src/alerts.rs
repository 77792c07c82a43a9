//! Operational alert fan-out.
//!
//! An [`AlertDispatcher`] hands every [`AlertEvent`] to the registered
//! notifiers that support its severity. Notifiers own their delivery
//! failures: they log and return, so one broken channel never stops the
//! others and never reaches the caller.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::UtcDateTime;
use crate::http_client::{HttpClient, HttpRequest};
use crate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub const ALL: [Self; 3] = [Self::Info, Self::Warning, Self::Critical];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    const fn color(self) -> &'static str {
        match self {
            Self::Info => "#2196F3",
            Self::Warning => "#FF9800",
            Self::Critical => "#F44336",
        }
    }
}

impl Display for AlertSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            _ => Err(ValidationError::InvalidSeverity {
                value: value.to_owned(),
            }),
        }
    }
}

/// Ephemeral operational event; dispatched, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub severity: AlertSeverity,
    pub kind: String,
    pub message: String,
    pub context: BTreeMap<String, Value>,
    pub occurred_at: UtcDateTime,
}

impl AlertEvent {
    pub fn new(severity: AlertSeverity, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind: kind.into(),
            message: message.into(),
            context: BTreeMap::new(),
            occurred_at: UtcDateTime::now(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Critical alert for a domain that denied collection requests.
    pub fn source_blocked(domain: &str, url: &str, retry_after: Option<UtcDateTime>) -> Self {
        let retry_after = retry_after.map_or_else(|| "unknown".to_owned(), UtcDateTime::format_rfc3339);
        Self::new(
            AlertSeverity::Critical,
            "SOURCE_BLOCKED",
            format!("Data source {domain} has blocked collection requests"),
        )
        .with_context("domain", domain)
        .with_context("blocked_url", url)
        .with_context("retry_after", retry_after)
        .with_context(
            "action_required",
            "Review rate limiting settings or enable proxy rotation",
        )
    }

    pub fn gate_failed(
        industry_id: &str,
        datapack_id: &str,
        error_count: usize,
        first_error: Option<&str>,
    ) -> Self {
        Self::new(
            AlertSeverity::Warning,
            "GATE_FAILED",
            format!("Collection gate failed for {industry_id}"),
        )
        .with_context("industry_id", industry_id)
        .with_context("datapack_id", datapack_id)
        .with_context("error_count", error_count)
        .with_context("first_error", first_error.unwrap_or("Unknown"))
    }
}

/// One alert channel.
pub trait AlertNotifier: Send + Sync {
    fn supports(&self, severity: AlertSeverity) -> bool;

    fn notify<'a>(&'a self, event: &'a AlertEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Default, Clone)]
pub struct AlertDispatcher {
    notifiers: Vec<Arc<dyn AlertNotifier>>,
}

impl AlertDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn AlertNotifier>>) -> Self {
        Self { notifiers }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub async fn dispatch(&self, event: &AlertEvent) {
        for notifier in &self.notifiers {
            if notifier.supports(event.severity) {
                notifier.notify(event).await;
            }
        }
    }
}

/// Writes alerts to the tracing log at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn supports(&self, _severity: AlertSeverity) -> bool {
        true
    }

    fn notify<'a>(&'a self, event: &'a AlertEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let context = Value::Object(
                event
                    .context
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            );
            match event.severity {
                AlertSeverity::Info => {
                    info!(kind = %event.kind, context = %context, "{}", event.message)
                }
                AlertSeverity::Warning => {
                    warn!(kind = %event.kind, context = %context, "{}", event.message)
                }
                AlertSeverity::Critical => {
                    error!(kind = %event.kind, context = %context, "{}", event.message)
                }
            }
        })
    }
}

/// Posts alerts to a Slack incoming webhook as colored attachments.
pub struct SlackNotifier {
    webhook_url: String,
    http: Arc<dyn HttpClient>,
    severities: Vec<AlertSeverity>,
}

impl SlackNotifier {
    const TIMEOUT_MS: u64 = 5_000;

    pub fn new(webhook_url: impl Into<String>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            http,
            severities: vec![AlertSeverity::Warning, AlertSeverity::Critical],
        }
    }

    pub fn with_severities(mut self, severities: Vec<AlertSeverity>) -> Self {
        self.severities = severities;
        self
    }

    fn payload(event: &AlertEvent) -> Value {
        let fields: Vec<Value> = event
            .context
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                json!({
                    "title": field_title(key),
                    "value": text,
                    "short": text.chars().count() < 40,
                })
            })
            .collect();

        json!({
            "attachments": [{
                "color": event.severity.color(),
                "title": format!("Datapack Collection Alert: {}", event.kind),
                "text": event.message,
                "fields": fields,
                "ts": event.occurred_at.unix_millis() / 1_000,
            }]
        })
    }
}

impl AlertNotifier for SlackNotifier {
    fn supports(&self, severity: AlertSeverity) -> bool {
        self.severities.contains(&severity)
    }

    fn notify<'a>(&'a self, event: &'a AlertEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let request = HttpRequest::post(self.webhook_url.clone())
                .with_header("content-type", "application/json")
                .with_body(Self::payload(event).to_string())
                .with_timeout_ms(Self::TIMEOUT_MS);

            match self.http.execute(request).await {
                Ok(response) if response.is_success() => {}
                Ok(response) => {
                    warn!(status = response.status, kind = %event.kind, "slack alert rejected");
                }
                Err(error) => {
                    warn!(error = %error, kind = %event.kind, "failed to send slack alert");
                }
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("failed to build alert email: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivery seam for [`EmailNotifier`].
pub trait MailTransport: Send + Sync {
    fn send<'a>(&'a self, message: Message) -> Pin<Box<dyn Future<Output = Result<(), MailError>> + Send + 'a>>;
}

/// SMTP relay with implicit TLS, port 465 unless overridden.
#[derive(Clone)]
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn relay(
        host: &str,
        port: Option<u16>,
        credentials: Option<(String, String)>,
    ) -> Result<Self, MailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)?;
        if let Some(port) = port {
            builder = builder.port(port);
        }
        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(Self {
            transport: builder.build(),
        })
    }
}

impl MailTransport for SmtpMailTransport {
    fn send<'a>(&'a self, message: Message) -> Pin<Box<dyn Future<Output = Result<(), MailError>> + Send + 'a>> {
        Box::pin(async move {
            self.transport.send(message).await?;
            Ok(())
        })
    }
}

/// Mails alerts as plain text. Critical only unless configured otherwise.
pub struct EmailNotifier {
    transport: Arc<dyn MailTransport>,
    from: Mailbox,
    to: Mailbox,
    severities: Vec<AlertSeverity>,
}

impl EmailNotifier {
    pub fn new(transport: Arc<dyn MailTransport>, from: &str, to: &str) -> Result<Self, ValidationError> {
        let mailbox = |address: &str| {
            address
                .parse::<Mailbox>()
                .map_err(|error| ValidationError::InvalidConfig {
                    message: format!("invalid email address '{address}': {error}"),
                })
        };
        Ok(Self {
            transport,
            from: mailbox(from)?,
            to: mailbox(to)?,
            severities: vec![AlertSeverity::Critical],
        })
    }

    pub fn with_severities(mut self, severities: Vec<AlertSeverity>) -> Self {
        self.severities = severities;
        self
    }

    fn subject(event: &AlertEvent) -> String {
        format!("[{}] Datapack: {}", event.severity, event.kind)
    }

    fn body(event: &AlertEvent) -> String {
        let mut body = format!(
            "Alert Details\n=============\n\nSeverity: {}\nType: {}\nTime: {}\n\nMessage:\n{}\n",
            event.severity,
            event.kind,
            event.occurred_at.format_rfc3339(),
            event.message
        );
        if !event.context.is_empty() {
            body.push_str("\nContext:\n");
            for (key, value) in &event.context {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                body.push_str(&format!("  {key}: {text}\n"));
            }
        }
        body
    }

    fn message(&self, event: &AlertEvent) -> Result<Message, MailError> {
        Ok(Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(Self::subject(event))
            .header(ContentType::TEXT_PLAIN)
            .body(Self::body(event))?)
    }
}

impl AlertNotifier for EmailNotifier {
    fn supports(&self, severity: AlertSeverity) -> bool {
        self.severities.contains(&severity)
    }

    fn notify<'a>(&'a self, event: &'a AlertEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let delivered = match self.message(event) {
                Ok(message) => self.transport.send(message).await,
                Err(error) => Err(error),
            };
            if let Err(error) = delivered {
                warn!(error = %error, kind = %event.kind, "failed to send email alert");
            }
        })
    }
}

fn field_title(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpError, HttpResponse, ScriptedHttpClient};
    use std::sync::Mutex;

    struct Recording {
        severities: Vec<AlertSeverity>,
        seen: Mutex<Vec<String>>,
    }

    impl AlertNotifier for Recording {
        fn supports(&self, severity: AlertSeverity) -> bool {
            self.severities.contains(&severity)
        }

        fn notify<'a>(
            &'a self,
            event: &'a AlertEvent,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            self.seen
                .lock()
                .expect("recording should not be poisoned")
                .push(event.kind.clone());
            Box::pin(async {})
        }
    }

    #[test]
    fn source_blocked_context_is_complete() {
        let retry = UtcDateTime::parse("2025-02-01T09:00:00Z").expect("timestamp");
        let event = AlertEvent::source_blocked("www.reuters.com", "https://www.reuters.com/x", Some(retry));
        assert_eq!(event.severity, AlertSeverity::Critical);
        assert_eq!(event.context["retry_after"], "2025-02-01T09:00:00Z");
        assert_eq!(event.context["blocked_url"], "https://www.reuters.com/x");

        let unknown = AlertEvent::source_blocked("www.reuters.com", "https://www.reuters.com/x", None);
        assert_eq!(unknown.context["retry_after"], "unknown");
    }

    #[test]
    fn gate_failed_is_a_warning_with_first_error() {
        let event = AlertEvent::gate_failed("oil-majors", "dp-1", 2, Some("missing SHEL"));
        assert_eq!(event.severity, AlertSeverity::Warning);
        assert_eq!(event.message, "Collection gate failed for oil-majors");
        assert_eq!(event.context["error_count"], 2);
        assert_eq!(event.context["first_error"], "missing SHEL");
    }

    #[tokio::test]
    async fn notifiers_only_receive_supported_severities() {
        for mask in 0..8_u8 {
            let severities: Vec<AlertSeverity> = AlertSeverity::ALL
                .into_iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << bit) != 0)
                .map(|(_, severity)| severity)
                .collect();
            let recording = Arc::new(Recording {
                severities: severities.clone(),
                seen: Mutex::new(Vec::new()),
            });
            let dispatcher = AlertDispatcher::default().with_notifier(recording.clone());

            for severity in AlertSeverity::ALL {
                dispatcher
                    .dispatch(&AlertEvent::new(severity, severity.as_str(), "check"))
                    .await;
            }

            let expected: Vec<String> = severities.iter().map(|s| s.as_str().to_owned()).collect();
            assert_eq!(
                *recording.seen.lock().expect("recording"),
                expected,
                "mask {mask:03b}"
            );
        }
    }

    #[tokio::test]
    async fn slack_failures_are_swallowed() {
        let http = Arc::new(ScriptedHttpClient::new());
        let webhook = "https://hooks.slack.test/services/T000";
        http.push(webhook, Err(HttpError::connect("connection refused")));
        let recording = Arc::new(Recording {
            severities: vec![AlertSeverity::Critical],
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = AlertDispatcher::default()
            .with_notifier(Arc::new(SlackNotifier::new(webhook, http.clone())))
            .with_notifier(recording.clone());

        dispatcher
            .dispatch(&AlertEvent::source_blocked("a.example", "https://a.example/", None))
            .await;

        assert_eq!(http.request_count(webhook), 1);
        assert_eq!(
            recording.seen.lock().expect("recording").as_slice(),
            ["SOURCE_BLOCKED".to_string()]
        );
    }

    #[tokio::test]
    async fn slack_payload_carries_color_and_fields() {
        let http = Arc::new(ScriptedHttpClient::new());
        let webhook = "https://hooks.slack.test/services/T001";
        http.push(webhook, Ok(HttpResponse::new(200, "ok")));
        let slack = SlackNotifier::new(webhook, http.clone());
        assert!(!slack.supports(AlertSeverity::Info));

        slack
            .notify(&AlertEvent::gate_failed("oil-majors", "dp-1", 1, None))
            .await;

        let requests = http.requests();
        let body: Value =
            serde_json::from_str(requests[0].body.as_deref().expect("body")).expect("json");
        let attachment = &body["attachments"][0];
        assert_eq!(attachment["color"], "#FF9800");
        assert_eq!(attachment["fields"][0]["title"], "Datapack id");
    }

    #[derive(Default)]
    struct RecordingMail {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MailTransport for RecordingMail {
        fn send<'a>(
            &'a self,
            message: Message,
        ) -> Pin<Box<dyn Future<Output = Result<(), MailError>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail {
                    return Err(MailError::Build(lettre::error::Error::MissingFrom));
                }
                self.sent
                    .lock()
                    .expect("mailbox should not be poisoned")
                    .push(String::from_utf8_lossy(&message.formatted()).into_owned());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn email_alerts_carry_subject_and_context() {
        let mail = Arc::new(RecordingMail::default());
        let email = EmailNotifier::new(mail.clone(), "collector@datapack.test", "ops@datapack.test")
            .expect("addresses");
        let dispatcher = AlertDispatcher::default().with_notifier(Arc::new(email));

        dispatcher
            .dispatch(&AlertEvent::source_blocked("www.reuters.com", "https://www.reuters.com/x", None))
            .await;

        let sent = mail.sent.lock().expect("mailbox");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Subject: [critical] Datapack: SOURCE_BLOCKED"), "{}", sent[0]);
        assert!(sent[0].contains("To: ops@datapack.test"));
        assert!(sent[0].contains("From: collector@datapack.test"));
        assert!(sent[0].contains("  domain: www.reuters.com"));
        assert!(sent[0].contains("  retry_after: unknown"));
    }

    #[tokio::test]
    async fn email_defaults_to_critical_and_honours_configured_severities() {
        let mail = Arc::new(RecordingMail::default());
        let email = EmailNotifier::new(mail.clone(), "collector@datapack.test", "ops@datapack.test")
            .expect("addresses");
        assert!(email.supports(AlertSeverity::Critical));
        assert!(!email.supports(AlertSeverity::Warning));
        assert!(!email.supports(AlertSeverity::Info));

        let dispatcher = AlertDispatcher::default().with_notifier(Arc::new(email));
        dispatcher
            .dispatch(&AlertEvent::gate_failed("oil-majors", "dp-1", 1, None))
            .await;
        assert!(mail.sent.lock().expect("mailbox").is_empty());

        let widened = EmailNotifier::new(mail.clone(), "collector@datapack.test", "ops@datapack.test")
            .expect("addresses")
            .with_severities(vec![AlertSeverity::Warning]);
        AlertDispatcher::default()
            .with_notifier(Arc::new(widened))
            .dispatch(&AlertEvent::gate_failed("oil-majors", "dp-1", 1, None))
            .await;
        let sent = mail.sent.lock().expect("mailbox");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Subject: [warning] Datapack: GATE_FAILED"));
    }

    #[tokio::test]
    async fn email_delivery_failures_are_swallowed() {
        let mail = Arc::new(RecordingMail {
            fail: true,
            ..RecordingMail::default()
        });
        let email = EmailNotifier::new(mail, "collector@datapack.test", "ops@datapack.test")
            .expect("addresses");
        let recording = Arc::new(Recording {
            severities: vec![AlertSeverity::Critical],
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = AlertDispatcher::default()
            .with_notifier(Arc::new(email))
            .with_notifier(recording.clone());

        dispatcher
            .dispatch(&AlertEvent::source_blocked("a.example", "https://a.example/", None))
            .await;
        assert_eq!(recording.seen.lock().expect("recording").len(), 1);
    }

    #[test]
    fn email_addresses_are_validated() {
        let mail = Arc::new(RecordingMail::default());
        assert!(EmailNotifier::new(mail, "not an address", "ops@datapack.test").is_err());
    }
}
