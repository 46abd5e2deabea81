use crate::client::{ClientError, SmtpClient, TlsStatus};
use crate::client_types::Response;
use crate::tls::TlsOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Disabled,
    /// Use STARTTLS when the EHLO response advertises it; continue in
    /// plaintext when the server refuses the upgrade
    Opportunistic,
    OpportunisticInsecure,
}

impl Default for TlsMode {
    fn default() -> Self {
        Self::OpportunisticInsecure
    }
}

#[derive(Debug, Clone)]
pub struct ConversationParams {
    /// Domain presented in EHLO
    pub helo_domain: String,
    /// Envelope sender for MAIL FROM; may be empty for a null sender
    pub mail_from: String,
    pub tls: TlsMode,
}

/// Run one verification conversation: banner, EHLO, opportunistic
/// STARTTLS, a single MAIL FROM, then one RCPT TO per recipient, sharing
/// the session. The conversation never progresses past RCPT: the DATA verb
/// does not exist in this client.
///
/// The outer error covers failures before any recipient could be tried
/// (connect, banner, EHLO, MAIL FROM); those apply to the whole batch.
/// Per-recipient entries record each RCPT reply independently; a rejection
/// of one recipient does not terminate the batch, but a transport failure
/// does, and the remaining recipients inherit that error.
pub async fn verify_recipients(
    client: &mut SmtpClient,
    params: &ConversationParams,
    recipients: &[String],
) -> Result<Vec<Result<Response, ClientError>>, ClientError> {
    client.read_banner().await?;
    client.ehlo(&params.helo_domain).await?;

    let insecure = match params.tls {
        TlsMode::Disabled => None,
        TlsMode::Opportunistic => Some(false),
        TlsMode::OpportunisticInsecure => Some(true),
    };
    if let Some(insecure) = insecure {
        if client.has_capability("STARTTLS") {
            match client.starttls(&TlsOptions { insecure }).await? {
                TlsStatus::Info(info) => {
                    tracing::debug!(
                        "{}: STARTTLS {} {}",
                        client.hostname(),
                        info.protocol_version,
                        info.cipher
                    );
                    // The session state resets across the TLS upgrade
                    client.ehlo(&params.helo_domain).await?;
                }
                TlsStatus::Refused(response) => {
                    tracing::debug!(
                        "{}: STARTTLS refused ({}), continuing in plaintext",
                        client.hostname(),
                        response.code
                    );
                }
            }
        }
    }

    client.mail_from(&params.mail_from).await?;

    let mut results: Vec<Result<Response, ClientError>> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        match client.rcpt_to(recipient).await {
            Ok(response) => results.push(Ok(response)),
            Err(err) => {
                // Transport is gone; the rest of the batch inherits the error
                results.push(Err(err.clone()));
                while results.len() < recipients.len() {
                    results.push(Err(err.clone()));
                }
                break;
            }
        }
    }

    client.quit().await;
    Ok(results)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client_types::SmtpClientTimeouts;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn params() -> ConversationParams {
        ConversationParams {
            helo_domain: "probe.example".to_string(),
            mail_from: "verify@probe.example".to_string(),
            tls: TlsMode::Disabled,
        }
    }

    /// A scripted SMTP server on the other end of a duplex pipe.
    /// Returns the transcript of client lines it received.
    fn spawn_server(stream: DuplexStream, drop_after_first_rcpt: bool) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut transcript = vec![];
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();

            write
                .write_all(b"220 mail.target.example ESMTP\r\n")
                .await
                .unwrap();

            let mut rcpt_count = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                transcript.push(line.clone());
                let upper = line.to_ascii_uppercase();
                let reply: &[u8] = if upper.starts_with("EHLO") {
                    b"250-mail.target.example\r\n250 8BITMIME\r\n"
                } else if upper.starts_with("MAIL FROM") {
                    b"250 2.1.0 sender ok\r\n"
                } else if upper.starts_with("RCPT TO:<GOOD") {
                    rcpt_count += 1;
                    b"250 2.1.5 recipient ok\r\n"
                } else if upper.starts_with("RCPT TO") {
                    rcpt_count += 1;
                    b"550 5.1.1 user unknown\r\n"
                } else if upper.starts_with("QUIT") {
                    write.write_all(b"221 2.0.0 bye\r\n").await.unwrap();
                    break;
                } else {
                    b"500 5.5.1 unrecognized\r\n"
                };
                write.write_all(reply).await.unwrap();
                if drop_after_first_rcpt && rcpt_count == 1 {
                    break;
                }
            }
            transcript
        })
    }

    #[tokio::test]
    async fn batch_records_each_recipient_and_never_sends_data() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        let server = spawn_server(server_stream, false);

        let mut client = SmtpClient::with_stream(
            client_stream,
            "mail.target.example",
            SmtpClientTimeouts::default(),
        );
        let recipients = vec![
            "good@target.example".to_string(),
            "missing@target.example".to_string(),
            "good2@target.example".to_string(),
        ];
        let results = verify_recipients(&mut client, &params(), &recipients)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().code, 250);
        let rejected = results[1].as_ref().unwrap();
        assert_eq!(rejected.code, 550);
        assert_eq!(rejected.content, "user unknown");
        // the 550 did not terminate the batch
        assert_eq!(results[2].as_ref().unwrap().code, 250);

        let transcript = server.await.unwrap();
        let mail_from_count = transcript
            .iter()
            .filter(|l| l.starts_with("MAIL FROM"))
            .count();
        assert_eq!(mail_from_count, 1, "one MAIL FROM for the whole batch");
        assert!(
            !transcript.iter().any(|l| l.trim() == "DATA"),
            "DATA must never appear in a probe conversation: {transcript:?}"
        );
        assert_eq!(transcript.last().map(|s| s.as_str()), Some("QUIT"));
    }

    #[tokio::test]
    async fn rejected_greeting_fails_the_batch() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (_read, mut write) = tokio::io::split(server_stream);
            write
                .write_all(b"554 5.7.1 go away\r\n")
                .await
                .unwrap();
        });

        let mut client = SmtpClient::with_stream(
            client_stream,
            "mail.target.example",
            SmtpClientTimeouts::default(),
        );
        let err = verify_recipients(&mut client, &params(), &["a@b.example".to_string()])
            .await
            .unwrap_err();
        match err {
            ClientError::Rejected(response) => assert_eq!(response.code, 554),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_loss_mid_batch_fails_remaining_recipients() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        let server = spawn_server(server_stream, true);

        let mut client = SmtpClient::with_stream(
            client_stream,
            "mail.target.example",
            SmtpClientTimeouts::default(),
        );
        let recipients = vec![
            "good@target.example".to_string(),
            "second@target.example".to_string(),
            "third@target.example".to_string(),
        ];
        let results = verify_recipients(&mut client, &params(), &recipients)
            .await
            .unwrap();

        assert_eq!(results[0].as_ref().unwrap().code, 250);
        assert!(results[1].is_err());
        assert!(results[2].is_err());
        server.await.unwrap();
    }
}
