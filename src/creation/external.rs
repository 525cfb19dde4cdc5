//! External collaborators for sign-up: CAPTCHA solver, disposable SMS
//! numbers, and the verification mailbox.
//!
//! All three poll on the same discipline: a bounded deadline with a fixed
//! interval, preemptible between polls.

use base64::Engine;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::CreationConfig;

/// Verification polls give up after this long.
pub const VERIFY_DEADLINE: Duration = Duration::from_secs(120);

/// Interval between verification polls.
pub const VERIFY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("captcha solver: {0}")]
    Captcha(String),

    #[error("sms provider: {0}")]
    Sms(String),

    #[error("mailbox: {0}")]
    Mailbox(String),

    #[error("verification timed out after {0:?}")]
    Timeout(Duration),
}

// ── CAPTCHA ──────────────────────────────────────────────────────────────────

const CAPTCHA_SUBMIT_URL: &str = "https://2captcha.com/in.php";
const CAPTCHA_RESULT_URL: &str = "https://2captcha.com/res.php";

#[derive(Deserialize)]
struct CaptchaResponse {
    status: i64,
    request: String,
}

/// Image-CAPTCHA solver speaking the 2captcha wire protocol.
pub struct CaptchaClient {
    http: reqwest::Client,
    api_key: String,
}

impl CaptchaClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            api_key,
        }
    }

    /// Submit a screenshot and poll for the solution text.
    pub async fn solve(&self, png: &[u8]) -> Result<String, ExternalError> {
        let body = base64::engine::general_purpose::STANDARD.encode(png);
        let submit: CaptchaResponse = self
            .http
            .post(CAPTCHA_SUBMIT_URL)
            .form(&[
                ("key", self.api_key.as_str()),
                ("method", "base64"),
                ("body", body.as_str()),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| ExternalError::Captcha(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExternalError::Captcha(e.to_string()))?;
        if submit.status != 1 {
            return Err(ExternalError::Captcha(submit.request));
        }
        let task_id = submit.request;

        let started = std::time::Instant::now();
        loop {
            tokio::time::sleep(VERIFY_INTERVAL).await;
            if started.elapsed() > VERIFY_DEADLINE {
                return Err(ExternalError::Timeout(VERIFY_DEADLINE));
            }
            let poll: CaptchaResponse = self
                .http
                .get(CAPTCHA_RESULT_URL)
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id.as_str()),
                    ("json", "1"),
                ])
                .send()
                .await
                .map_err(|e| ExternalError::Captcha(e.to_string()))?
                .json()
                .await
                .map_err(|e| ExternalError::Captcha(e.to_string()))?;
            if poll.status == 1 {
                return Ok(poll.request);
            }
            if poll.request != "CAPCHA_NOT_READY" {
                return Err(ExternalError::Captcha(poll.request));
            }
        }
    }
}

// ── SMS ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SmsRental {
    id: String,
    number: String,
}

#[derive(Deserialize)]
struct SmsPoll {
    code: Option<String>,
}

/// Disposable-number provider with a small JSON surface: rent a number,
/// poll it for the verification code.
pub struct SmsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SmsClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            base_url,
            api_key,
        }
    }

    pub async fn rent_number(&self) -> Result<(String, String), ExternalError> {
        let rental: SmsRental = self
            .http
            .post(format!("{}/numbers", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ExternalError::Sms(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExternalError::Sms(e.to_string()))?;
        Ok((rental.id, rental.number))
    }

    /// Poll the rented number for its verification code.
    pub async fn await_code(&self, rental_id: &str) -> Result<String, ExternalError> {
        let started = std::time::Instant::now();
        loop {
            tokio::time::sleep(VERIFY_INTERVAL).await;
            if started.elapsed() > VERIFY_DEADLINE {
                return Err(ExternalError::Timeout(VERIFY_DEADLINE));
            }
            let poll: SmsPoll = self
                .http
                .get(format!("{}/numbers/{}/messages", self.base_url, rental_id))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| ExternalError::Sms(e.to_string()))?
                .json()
                .await
                .map_err(|e| ExternalError::Sms(e.to_string()))?;
            if let Some(code) = poll.code {
                return Ok(code);
            }
        }
    }

    pub async fn release(&self, rental_id: &str) {
        let _ = self
            .http
            .delete(format!("{}/numbers/{}", self.base_url, rental_id))
            .bearer_auth(&self.api_key)
            .send()
            .await;
    }
}

// ── Mailbox (IMAP) ───────────────────────────────────────────────────────────

/// Minimal IMAP client for the catch-all verification mailbox: log in,
/// search unseen mail, fetch bodies, extract the 6-digit code.
pub struct MailboxClient {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl MailboxClient {
    pub fn new(host: String, port: u16, user: String, password: String) -> Self {
        Self {
            host,
            port,
            user,
            password,
        }
    }

    /// Poll the inbox until a verification code addressed to `alias`
    /// arrives.
    pub async fn await_code(&self, alias: &str) -> Result<String, ExternalError> {
        let started = std::time::Instant::now();
        loop {
            tokio::time::sleep(VERIFY_INTERVAL).await;
            if started.elapsed() > VERIFY_DEADLINE {
                return Err(ExternalError::Timeout(VERIFY_DEADLINE));
            }
            if let Some(code) = self.check_once(alias).await? {
                return Ok(code);
            }
        }
    }

    async fn check_once(&self, alias: &str) -> Result<Option<String>, ExternalError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ExternalError::Mailbox(e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        reader
            .read_line(&mut greeting)
            .await
            .map_err(|e| ExternalError::Mailbox(e.to_string()))?;

        send_command(
            &mut write_half,
            &mut reader,
            "a1",
            &format!("LOGIN {} {}", quote(&self.user), quote(&self.password)),
        )
        .await?;
        send_command(&mut write_half, &mut reader, "a2", "SELECT INBOX").await?;

        let search = send_command(&mut write_half, &mut reader, "a3", "SEARCH UNSEEN").await?;
        let ids: Vec<&str> = search
            .lines()
            .find(|line| line.starts_with("* SEARCH"))
            .map(|line| line.trim_start_matches("* SEARCH").split_whitespace().collect())
            .unwrap_or_default();

        for id in ids.iter().rev().take(10) {
            let body = send_command(
                &mut write_half,
                &mut reader,
                "a4",
                &format!("FETCH {} BODY[TEXT]", id),
            )
            .await?;
            if !body.to_lowercase().contains(&alias.to_lowercase()) {
                continue;
            }
            if let Some(code) = extract_code(&body) {
                let _ = send_command(&mut write_half, &mut reader, "a5", "LOGOUT").await;
                return Ok(Some(code));
            }
        }

        let _ = send_command(&mut write_half, &mut reader, "a5", "LOGOUT").await;
        Ok(None)
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

async fn send_command(
    writer: &mut (impl AsyncWriteExt + Unpin),
    reader: &mut BufReader<impl AsyncReadExt + Unpin>,
    tag: &str,
    command: &str,
) -> Result<String, ExternalError> {
    writer
        .write_all(format!("{} {}\r\n", tag, command).as_bytes())
        .await
        .map_err(|e| ExternalError::Mailbox(e.to_string()))?;

    let mut response = String::new();
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ExternalError::Mailbox(e.to_string()))?;
        if read == 0 {
            return Err(ExternalError::Mailbox("connection closed".into()));
        }
        let done = line.starts_with(tag);
        let failed = done && !line.contains("OK");
        response.push_str(&line);
        if done {
            if failed {
                return Err(ExternalError::Mailbox(line.trim().to_string()));
            }
            return Ok(response);
        }
    }
}

/// First run of exactly six digits in the text.
fn extract_code(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 6 {
                return Some(text[start..i].to_string());
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Bundle of configured collaborators, or None when any is missing.
pub struct ExternalServices {
    pub captcha: CaptchaClient,
    pub sms: SmsClient,
    pub mailbox: MailboxClient,
    /// Domain for catch-all aliases, derived from the mailbox user.
    pub mail_domain: String,
}

impl ExternalServices {
    pub fn from_config(config: &CreationConfig) -> Option<ExternalServices> {
        if !config.is_enabled() {
            return None;
        }
        let imap_user = config.imap_user.clone()?;
        let mail_domain = imap_user
            .split_once('@')
            .map(|(_, domain)| domain.to_string())
            .unwrap_or_else(|| "example.com".to_string());
        Some(ExternalServices {
            captcha: CaptchaClient::new(config.captcha_api_key.clone()?),
            sms: SmsClient::new(config.sms_api_url.clone()?, config.sms_api_key.clone()?),
            mailbox: MailboxClient::new(
                config.imap_host.clone()?,
                config.imap_port,
                imap_user,
                config.imap_password.clone()?,
            ),
            mail_domain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_code_finds_exact_six_digits() {
        assert_eq!(
            extract_code("Your verification code is 482913. Enjoy!"),
            Some("482913".to_string())
        );
        // Longer digit runs are order ids, not codes.
        assert_eq!(extract_code("order 12345678 shipped, code 555123"), Some("555123".into()));
        assert_eq!(extract_code("no digits here"), None);
        assert_eq!(extract_code("too short 12345"), None);
    }

    #[test]
    fn imap_quoting_escapes_credentials() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("pa\"ss"), "\"pa\\\"ss\"");
    }

    #[test]
    fn services_absent_without_full_config() {
        assert!(ExternalServices::from_config(&CreationConfig::default()).is_none());
    }

    #[test]
    fn mail_domain_derived_from_imap_user() {
        let config = CreationConfig {
            captcha_api_key: Some("k".into()),
            sms_api_url: Some("https://sms.example".into()),
            sms_api_key: Some("k".into()),
            imap_host: Some("mail.example.com".into()),
            imap_port: 143,
            imap_user: Some("inbox@accounts.example.com".into()),
            imap_password: Some("p".into()),
        };
        let services = ExternalServices::from_config(&config).unwrap();
        assert_eq!(services.mail_domain, "accounts.example.com");
    }
}
