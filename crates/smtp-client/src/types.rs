use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The subset of SMTP commands a verification probe needs. The probe
/// never transmits mail, so DATA has no representation here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Noop,
    Rset,
    Quit,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom(address) if address.is_empty() => "MAIL FROM:<>\r\n".to_string(),
            Self::MailFrom(address) => format!("MAIL FROM:<{address}>\r\n"),
            Self::RcptTo(address) => format!("RCPT TO:<{address}>\r\n"),
            Self::Noop => "NOOP\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
        }
    }

    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Ehlo(_) | Self::Helo(_) => timeouts.ehlo_timeout,
            Self::MailFrom(_) => timeouts.mail_from_timeout,
            Self::RcptTo(_) => timeouts.rcpt_to_timeout,
            Self::Noop => timeouts.noop_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::Quit => timeouts.quit_timeout,
        }
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SmtpClientTimeouts {
    #[serde(
        default = "SmtpClientTimeouts::default_connect_timeout",
        with = "duration_serde"
    )]
    pub connect_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_banner_timeout",
        with = "duration_serde"
    )]
    pub banner_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_ehlo_timeout",
        with = "duration_serde"
    )]
    pub ehlo_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_mail_from_timeout",
        with = "duration_serde"
    )]
    pub mail_from_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_rcpt_to_timeout",
        with = "duration_serde"
    )]
    pub rcpt_to_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_noop_timeout",
        with = "duration_serde"
    )]
    pub noop_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_rset_timeout",
        with = "duration_serde"
    )]
    pub rset_timeout: Duration,
    #[serde(
        default = "SmtpClientTimeouts::default_quit_timeout",
        with = "duration_serde"
    )]
    pub quit_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            banner_timeout: Self::default_banner_timeout(),
            ehlo_timeout: Self::default_ehlo_timeout(),
            mail_from_timeout: Self::default_mail_from_timeout(),
            rcpt_to_timeout: Self::default_rcpt_to_timeout(),
            noop_timeout: Self::default_noop_timeout(),
            rset_timeout: Self::default_rset_timeout(),
            quit_timeout: Self::default_quit_timeout(),
        }
    }
}

impl SmtpClientTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_banner_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_ehlo_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_mail_from_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_rcpt_to_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_noop_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_rset_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_quit_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Uniformly short timeouts for tests.
    pub fn short_timeouts() -> Self {
        let short = Duration::from_secs(2);
        Self {
            connect_timeout: short,
            banner_timeout: short,
            ehlo_timeout: short,
            mail_from_timeout: short,
            rcpt_to_timeout: short,
            noop_timeout: short,
            rset_timeout: short,
            quit_timeout: short,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

/// A complete (possibly multi-line) SMTP reply.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);
        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }
        line.push_str(&self.content.replace("\r\n", " ").replace('\n', " "));
        line
    }
}

pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

/// Parse one `250-blah` / `250 blah` reply line.
pub(crate) fn parse_response_line(line: &str) -> Result<ResponseLine, String> {
    if line.len() < 4 {
        return Err(line.to_string());
    }
    match line.as_bytes()[3] {
        sep @ (b' ' | b'-') => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: sep == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(line.to_string()),
        },
        _ => Err(line.to_string()),
    }
}

pub(crate) struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(first: &ResponseLine) -> Self {
        let (enhanced_code, content) = extract_enhanced_code(first.code, first.content);
        Self {
            code: first.code,
            enhanced_code,
            content: content.to_string(),
        }
    }

    pub fn add_line(&mut self, line: &ResponseLine) -> Result<(), String> {
        if line.code != self.code {
            return Err(format!(
                "mismatched codes in multi-line response: {} vs {}",
                self.code, line.code
            ));
        }
        self.content.push('\n');
        let (_, content) = extract_enhanced_code(line.code, line.content);
        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.content,
            command,
        }
    }
}

/// Split a leading RFC 3463 enhanced status code (eg: `2.1.5 Ok`) off
/// the reply text. Only 2xx/4xx/5xx replies carry one.
fn extract_enhanced_code(code: u16, content: &str) -> (Option<EnhancedStatusCode>, &str) {
    let class = code / 100;
    if !matches!(class, 2 | 4 | 5) {
        return (None, content);
    }
    let mut fields = content.splitn(2, ' ');
    let candidate = fields.next().unwrap_or("");
    let rest = fields.next().unwrap_or("");

    let mut parts = candidate.split('.');
    let parsed = (|| {
        let c = parts.next()?.parse::<u8>().ok()?;
        let subject = parts.next()?.parse::<u16>().ok()?;
        let detail = parts.next()?.parse::<u16>().ok()?;
        if parts.next().is_some() || u16::from(c) != class {
            return None;
        }
        Some(EnhancedStatusCode {
            class: c,
            subject,
            detail,
        })
    })();

    match parsed {
        Some(enhanced) => (Some(enhanced), rest),
        None => (None, content),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_encoding() {
        assert_eq!(
            Command::Ehlo("probe.example.com".to_string()).encode(),
            "EHLO probe.example.com\r\n"
        );
        assert_eq!(
            Command::MailFrom("verify@example.com".to_string()).encode(),
            "MAIL FROM:<verify@example.com>\r\n"
        );
        assert_eq!(Command::MailFrom(String::new()).encode(), "MAIL FROM:<>\r\n");
        assert_eq!(
            Command::RcptTo("user@example.com".to_string()).encode(),
            "RCPT TO:<user@example.com>\r\n"
        );
        assert_eq!(Command::Noop.encode(), "NOOP\r\n");
        assert_eq!(Command::Rset.encode(), "RSET\r\n");
        assert_eq!(Command::Quit.encode(), "QUIT\r\n");
    }

    #[test]
    fn parse_single_line() {
        let line = parse_response_line("220 mail.example.com ESMTP").unwrap();
        assert_eq!(line.code, 220);
        assert!(line.is_final);
        assert_eq!(line.content, "mail.example.com ESMTP");

        let line = parse_response_line("250-PIPELINING").unwrap();
        assert!(!line.is_final);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_response_line("2x0 nope").is_err());
        assert!(parse_response_line("250_nope").is_err());
        assert!(parse_response_line("25").is_err());
    }

    #[test]
    fn multi_line_response() {
        let first = parse_response_line("250-mail.example.com").unwrap();
        let mut builder = ResponseBuilder::new(&first);
        for line in ["250-PIPELINING", "250 SIZE 31457280"] {
            builder.add_line(&parse_response_line(line).unwrap()).unwrap();
        }
        let response = builder.build(Some("EHLO test\r\n".to_string()));
        assert_eq!(response.code, 250);
        assert_eq!(
            response.content,
            "mail.example.com\nPIPELINING\nSIZE 31457280"
        );
    }

    #[test]
    fn enhanced_code_extraction() {
        let first = parse_response_line("550 5.1.1 User unknown").unwrap();
        let response = ResponseBuilder::new(&first).build(None);
        assert_eq!(
            response.enhanced_code,
            Some(EnhancedStatusCode {
                class: 5,
                subject: 1,
                detail: 1
            })
        );
        assert_eq!(response.content, "User unknown");
        assert_eq!(response.to_single_line(), "550 5.1.1 User unknown");
    }

    #[test]
    fn enhanced_code_class_must_match() {
        // 4.x.x on a 550 reply is not a valid enhanced code
        let first = parse_response_line("550 4.1.1 weird").unwrap();
        let response = ResponseBuilder::new(&first).build(None);
        assert_eq!(response.enhanced_code, None);
        assert_eq!(response.content, "4.1.1 weird");
    }

    #[test]
    fn transient_and_permanent() {
        let first = parse_response_line("451 try again later").unwrap();
        let response = ResponseBuilder::new(&first).build(None);
        assert!(response.is_transient());
        assert!(!response.is_permanent());
    }
}
