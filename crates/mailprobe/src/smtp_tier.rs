use crate::limits::ProbeLimiter;
use async_trait::async_trait;
use dns_resolver::{MailExchanger, MxResolver};
use smtp_probe::{
    verify_recipients, ClientError, ConversationParams, Response, SmtpClient, SmtpClientTimeouts,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// The outcome of attempting to verify one recipient.
#[derive(Debug, Clone)]
pub enum RcptOutcome {
    /// A server answered the RCPT; the reply may be any code
    Reply { mx_host: String, response: Response },
    /// No server produced a reply for this recipient
    NoAnswer { why: String },
}

impl RcptOutcome {
    pub fn no_answer(why: impl Into<String>) -> Self {
        Self::NoAnswer { why: why.into() }
    }
}

/// The seam between the dispatcher and the wire. The production
/// implementation drives real conversations; tests script outcomes.
#[async_trait]
pub trait RcptVerifier: Send + Sync {
    /// Verify recipients against the MX set, batching them into shared
    /// conversations. The result is aligned with `recipients`.
    async fn verify(&self, mx: &MailExchanger, recipients: &[String]) -> Vec<RcptOutcome>;
}

/// Drives real SMTP conversations, one per MX candidate until a
/// conversation completes, under the global and per-host caps.
pub struct SmtpVerifier {
    resolver: Arc<MxResolver>,
    limiter: Arc<ProbeLimiter>,
    params: ConversationParams,
    timeouts: SmtpClientTimeouts,
    port: u16,
    conversation_cap: usize,
}

impl SmtpVerifier {
    pub fn new(
        resolver: Arc<MxResolver>,
        limiter: Arc<ProbeLimiter>,
        params: ConversationParams,
        timeouts: SmtpClientTimeouts,
        port: u16,
        conversation_cap: usize,
    ) -> Self {
        Self {
            resolver,
            limiter,
            params,
            timeouts,
            port,
            conversation_cap,
        }
    }

    /// Run one conversation for a chunk of recipients against the MX
    /// candidates in preference order.
    async fn verify_chunk(&self, mx: &MailExchanger, recipients: &[String]) -> Vec<RcptOutcome> {
        let candidates = self.resolver.resolve_addresses(mx).await;
        if candidates.is_empty() {
            return vec![RcptOutcome::no_answer("no resolvable MX address"); recipients.len()];
        }

        let mut last_why = String::new();
        for candidate in &candidates {
            let _permit = match self.limiter.acquire_smtp(&candidate.name).await {
                Ok(permit) => permit,
                Err(_) => {
                    return vec![RcptOutcome::no_answer("overloaded"); recipients.len()];
                }
            };

            let address = SocketAddr::new(candidate.addr, self.port);
            let mut client =
                match SmtpClient::connect(address, &candidate.name, self.timeouts).await {
                    Ok(client) => client,
                    Err(err) => {
                        tracing::debug!("connect {address} failed: {err:#}");
                        last_why = format!("{err:#}");
                        continue;
                    }
                };

            match verify_recipients(&mut client, &self.params, recipients).await {
                Ok(replies) => {
                    return replies
                        .into_iter()
                        .map(|reply| match reply {
                            Ok(response) => RcptOutcome::Reply {
                                mx_host: candidate.name.clone(),
                                response,
                            },
                            Err(err) => RcptOutcome::no_answer(format!("{err:#}")),
                        })
                        .collect();
                }
                Err(ClientError::Rejected(response)) if response.is_transient() => {
                    // e.g. a 421 greeting; the next MX may be healthier
                    last_why = format!("session rejected: {}", response.to_single_line());
                    continue;
                }
                Err(ClientError::Rejected(response)) => {
                    // The session itself was refused (greeting, EHLO or
                    // MAIL FROM); that says nothing about the recipients
                    return vec![
                        RcptOutcome::no_answer(format!(
                            "session rejected: {}",
                            response.to_single_line()
                        ));
                        recipients.len()
                    ];
                }
                Err(err) => {
                    last_why = format!("{err:#}");
                    continue;
                }
            }
        }

        if last_why.is_empty() {
            last_why = "all MX hosts exhausted".to_string();
        }
        vec![RcptOutcome::no_answer(last_why); recipients.len()]
    }
}

#[async_trait]
impl RcptVerifier for SmtpVerifier {
    async fn verify(&self, mx: &MailExchanger, recipients: &[String]) -> Vec<RcptOutcome> {
        let mut outcomes = Vec::with_capacity(recipients.len());
        for chunk in recipients.chunks(self.conversation_cap.max(1)) {
            outcomes.extend(self.verify_chunk(mx, chunk).await);
        }
        outcomes
    }
}

/// A scripted verifier for exercising the dispatcher without sockets.
/// Per-address scripts are sequences: each probe consumes the next reply
/// and the final one repeats, which models servers that answer
/// differently on re-verification. Every recipient asked about is
/// recorded, so tests can assert probe counts (e.g. catch-all
/// single-flight).
#[derive(Default)]
pub struct ScriptedRcptVerifier {
    replies: parking_lot::Mutex<std::collections::HashMap<String, std::collections::VecDeque<ScriptedReply>>>,
    domain_replies: parking_lot::Mutex<std::collections::HashMap<String, ScriptedReply>>,
    probed: parking_lot::Mutex<Vec<String>>,
    delay: Option<std::time::Duration>,
}

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Accept,
    Reject { code: u16, text: String },
    Transient { code: u16, text: String },
    NoAnswer { why: String },
}

impl ScriptedReply {
    pub fn reject(code: u16, text: &str) -> Self {
        Self::Reject {
            code,
            text: text.to_string(),
        }
    }
    pub fn transient(code: u16, text: &str) -> Self {
        Self::Transient {
            code,
            text: text.to_string(),
        }
    }
}

impl ScriptedRcptVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next reply for one exact recipient address. Calling
    /// this repeatedly for the same address builds a sequence; the last
    /// reply repeats once the sequence is exhausted.
    pub fn with_reply(self, address: &str, reply: ScriptedReply) -> Self {
        self.replies
            .lock()
            .entry(address.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Script the fallback reply for any recipient in a domain; this is
    /// what the random catch-all probe hits
    pub fn with_domain_reply(self, domain: &str, reply: ScriptedReply) -> Self {
        self.domain_replies.lock().insert(domain.to_string(), reply);
        self
    }

    /// Delay every verify call, to model a slow destination
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every recipient this verifier has been asked about, in order
    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().clone()
    }

    fn reply_for(&self, recipient: &str) -> ScriptedReply {
        if let Some(sequence) = self.replies.lock().get_mut(recipient) {
            if sequence.len() > 1 {
                return sequence.pop_front().expect("sequence is non-empty");
            }
            if let Some(reply) = sequence.front() {
                return reply.clone();
            }
        }
        let domain = recipient.split('@').next_back().unwrap_or("");
        if let Some(reply) = self.domain_replies.lock().get(domain) {
            return reply.clone();
        }
        ScriptedReply::NoAnswer {
            why: "unscripted recipient".to_string(),
        }
    }
}

fn scripted_response(code: u16, text: &str) -> Response {
    Response {
        code,
        enhanced_code: None,
        content: text.to_string(),
        command: None,
    }
}

#[async_trait]
impl RcptVerifier for ScriptedRcptVerifier {
    async fn verify(&self, mx: &MailExchanger, recipients: &[String]) -> Vec<RcptOutcome> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mx_host = mx
            .hosts
            .first()
            .cloned()
            .unwrap_or_else(|| "mx.test".to_string());
        recipients
            .iter()
            .map(|recipient| {
                self.probed.lock().push(recipient.clone());
                match self.reply_for(recipient) {
                    ScriptedReply::Accept => RcptOutcome::Reply {
                        mx_host: mx_host.clone(),
                        response: scripted_response(250, "2.1.5 recipient ok"),
                    },
                    ScriptedReply::Reject { code, text } => RcptOutcome::Reply {
                        mx_host: mx_host.clone(),
                        response: scripted_response(code, &text),
                    },
                    ScriptedReply::Transient { code, text } => RcptOutcome::Reply {
                        mx_host: mx_host.clone(),
                        response: scripted_response(code, &text),
                    },
                    ScriptedReply::NoAnswer { why } => RcptOutcome::NoAnswer { why },
                }
            })
            .collect()
    }
}
