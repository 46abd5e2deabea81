use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-command timeouts for the probe conversation. The defaults reflect
/// verification rather than delivery: a host that cannot answer a command
/// within a few seconds is not going to give us a useful signal.
#[derive(Serialize, Deserialize, Copy, Clone, Debug)]
pub struct SmtpClientTimeouts {
    #[serde(
        default = "SmtpClientTimeouts::default_command_timeout",
        with = "crate::duration_serde"
    )]
    pub connect_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_command_timeout",
        with = "crate::duration_serde"
    )]
    pub banner_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_command_timeout",
        with = "crate::duration_serde"
    )]
    pub ehlo_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_command_timeout",
        with = "crate::duration_serde"
    )]
    pub starttls_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_command_timeout",
        with = "crate::duration_serde"
    )]
    pub mail_from_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_command_timeout",
        with = "crate::duration_serde"
    )]
    pub rcpt_to_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_short_timeout",
        with = "crate::duration_serde"
    )]
    pub rset_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_short_timeout",
        with = "crate::duration_serde"
    )]
    pub quit_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_command_timeout(),
            banner_timeout: Self::default_command_timeout(),
            ehlo_timeout: Self::default_command_timeout(),
            starttls_timeout: Self::default_command_timeout(),
            mail_from_timeout: Self::default_command_timeout(),
            rcpt_to_timeout: Self::default_command_timeout(),
            rset_timeout: Self::default_short_timeout(),
            quit_timeout: Self::default_short_timeout(),
        }
    }
}

impl SmtpClientTimeouts {
    fn default_command_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_short_timeout() -> Duration {
        Duration::from_secs(2)
    }

    /// Theoretical maximum lifetime of a single-recipient conversation
    pub fn total_conversation_duration(&self) -> Duration {
        self.connect_timeout
            + self.banner_timeout
            + self.ehlo_timeout * 2
            + self.starttls_timeout
            + self.mail_from_timeout
            + self.rcpt_to_timeout
            + self.quit_timeout
    }
}

/// The commands the probe can issue. There is intentionally no DATA
/// variant: this client is structurally incapable of sending a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    StartTls,
    MailFrom { address: String },
    RcptTo { address: String },
    Rset,
    Quit,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::MailFrom { address } => format!("MAIL FROM:<{address}>\r\n"),
            Self::RcptTo { address } => format!("RCPT TO:<{address}>\r\n"),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
        }
    }

    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Ehlo(_) | Self::Helo(_) => timeouts.ehlo_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::Quit => timeouts.quit_timeout,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    #[serde(serialize_with = "as_single_line")]
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }

        line.push_str(&remove_line_break(&self.content));

        line
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

/// A single parsed line of a (possibly multi-line) reply
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl ResponseLine<'_> {
    fn reconstitute(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { ' ' } else { '-' },
            self.content
        )
    }
}

pub fn parse_response_line(line: &str) -> Result<ResponseLine, String> {
    if line.len() < 4 {
        return Err(line.to_string());
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(line.to_string()),
        },
        _ => Err(line.to_string()),
    }
}

/// Accumulates the lines of a reply into a Response.
/// The enhanced status code of the first line, when present, is hoisted out
/// of the text; continuation lines drop their copy of it only when it
/// matches the first line's code.
#[derive(Debug)]
pub struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let (enhanced_code, text) = parse_enhanced_status_code(parsed.content);
        Self {
            code: parsed.code,
            enhanced_code,
            content: text.to_string(),
        }
    }

    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.reconstitute());
        }
        self.content.push('\n');
        let (enhanced_code, text) = parse_enhanced_status_code(parsed.content);
        if enhanced_code.is_some() && enhanced_code == self.enhanced_code {
            self.content.push_str(text);
        } else {
            self.content.push_str(parsed.content);
        }
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

fn parse_enhanced_status_code(content: &str) -> (Option<EnhancedStatusCode>, &str) {
    let mut fields = content.splitn(2, ' ');
    let (Some(code), Some(rest)) = (fields.next(), fields.next()) else {
        return (None, content);
    };

    let mut parts = code.split('.');
    let parsed = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(class), Some(subject), Some(detail), None) => {
            match (
                class.parse::<u8>(),
                subject.parse::<u16>(),
                detail.parse::<u16>(),
            ) {
                (Ok(class), Ok(subject), Ok(detail)) if class <= 5 => Some(EnhancedStatusCode {
                    class,
                    subject,
                    detail,
                }),
                _ => None,
            }
        }
        _ => None,
    };

    match parsed {
        Some(code) => (Some(code), rest),
        None => (None, content),
    }
}

fn remove_line_break(line: &str) -> String {
    let mut new_line = String::new();
    let mut cr_to_space = false;

    for c in line.chars() {
        match c {
            '\r' => {
                new_line.push(' ');
                cr_to_space = true;
            }
            '\n' => {
                if !cr_to_space {
                    new_line.push(' ');
                } else {
                    cr_to_space = false;
                }
            }
            c => new_line.push(c),
        }
    }
    new_line
}

fn as_single_line<S>(content: &String, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&remove_line_break(content))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_data_command_exists() {
        // Every encodable command; none of them is DATA and none of their
        // encodings contains the DATA verb
        let commands = [
            Command::Ehlo("probe.example".to_string()),
            Command::Helo("probe.example".to_string()),
            Command::StartTls,
            Command::MailFrom {
                address: "verify@probe.example".to_string(),
            },
            Command::RcptTo {
                address: "someone@target.example".to_string(),
            },
            Command::Rset,
            Command::Quit,
        ];
        for cmd in commands {
            assert!(!cmd.encode().contains("DATA"), "{cmd:?}");
        }
    }

    #[test]
    fn response_line_parsing() {
        k9::assert_equal!(
            parse_response_line("220 woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            }
        );
        k9::assert_equal!(
            parse_response_line("220-woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            }
        );

        assert!(parse_response_line("220_woot").is_err());
        assert!(parse_response_line("not really").is_err());
    }

    fn parse_multi_line(lines: &[&str]) -> Result<Response, String> {
        let mut parsed = parse_response_line(lines[0])?;
        let mut b = ResponseBuilder::new(&parsed);
        for line in &lines[1..] {
            parsed = parse_response_line(line)?;
            b.add_line(&parsed)?;
        }
        assert!(parsed.is_final);
        Ok(b.build(None))
    }

    #[test]
    fn multi_line_response() {
        k9::assert_equal!(
            parse_multi_line(&["220-woot", "220-more", "220 done"]).unwrap(),
            Response {
                code: 220,
                enhanced_code: None,
                content: "woot\nmore\ndone".to_string(),
                command: None
            }
        );

        let res = parse_multi_line(&["220-woot", "221-more", "220 done"]).unwrap_err();
        k9::assert_equal!(res, "221-more");

        k9::assert_equal!(
            parse_multi_line(&["550-5.1.1 no such user", "550 5.1.1 gone"]).unwrap(),
            Response {
                code: 550,
                enhanced_code: Some(EnhancedStatusCode {
                    class: 5,
                    subject: 1,
                    detail: 1
                }),
                content: "no such user\ngone".to_string(),
                command: None
            }
        );

        // mismatched enhanced code on a continuation line is kept verbatim
        k9::assert_equal!(
            parse_multi_line(&["220-4.1.0 woot", "220-4.1.0 more", "220 5.5.5 done"]).unwrap(),
            Response {
                code: 220,
                enhanced_code: Some(EnhancedStatusCode {
                    class: 4,
                    subject: 1,
                    detail: 0
                }),
                content: "woot\nmore\n5.5.5 done".to_string(),
                command: None
            }
        );
    }

    #[test]
    fn single_line_rendering() {
        let response = Response {
            code: 550,
            enhanced_code: Some(EnhancedStatusCode {
                class: 5,
                subject: 1,
                detail: 1
            }),
            content: "mailbox\nunavailable".to_string(),
            command: None,
        };
        k9::assert_equal!(response.to_single_line(), "550 5.1.1 mailbox unavailable");
        assert!(response.is_permanent());
        assert!(!response.is_transient());
    }
}
