//! PostgreSQL replication client
//!
//! Low-level TCP client for the streaming replication protocol: startup in
//! replication mode, MD5/cleartext authentication, CopyBoth streaming and
//! standby status updates. Slot and publication DDL run on the query
//! connection (see `schema`), not here.

use anyhow::{anyhow, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::lsn::Lsn;
use crate::postgres::config::PgConnectOptions;

/// A typed server error carrying the SQLSTATE, so callers can tell
/// "object in use" from everything else.
#[derive(Debug, Clone, thiserror::Error)]
#[error("server error {code}: {message}")]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    /// SQLSTATE 55006: object_in_use - the slot is held by a live walsender.
    pub fn is_object_in_use(&self) -> bool {
        self.code == "55006"
    }
}

/// Parse the field list of an ErrorResponse body.
fn parse_error_response(mut body: &[u8]) -> ServerError {
    let mut code = String::new();
    let mut message = String::new();
    while let Some((&field, rest)) = body.split_first() {
        if field == 0 {
            break;
        }
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        match field {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
        body = rest.get(end + 1..).unwrap_or(&[]);
    }
    ServerError { code, message }
}

/// PostgreSQL replication-mode client
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connect to PostgreSQL in replication mode
    pub async fn connect(options: &PgConnectOptions) -> Result<Self> {
        info!(
            "connecting to {}:{} as {} (replication)",
            options.host, options.port, options.user
        );
        let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        let mut stream = BufReader::new(stream);

        // 1. Startup message with replication=database
        let params = vec![
            ("user", options.user.as_str()),
            ("database", options.dbname.as_str()),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        // 2. Authentication
        loop {
            let (type_code, body) = read_raw_message(&mut stream).await?;

            let mut raw_msg = BytesMut::with_capacity(5 + body.len());
            raw_msg.put_u8(type_code);
            raw_msg.put_i32((body.len() + 4) as i32);
            raw_msg.put_slice(&body);

            let msg = backend::Message::parse(&mut raw_msg)?
                .ok_or_else(|| anyhow!("failed to parse auth message"))?;

            match msg {
                backend::Message::AuthenticationOk => {
                    debug!("authentication successful");
                    break;
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let pass = options
                        .password
                        .as_deref()
                        .ok_or_else(|| anyhow!("password required but not provided"))?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationMd5Password(md5_body) => {
                    let pass = options
                        .password
                        .as_deref()
                        .ok_or_else(|| anyhow!("password required but not provided"))?;
                    let hash = hash_md5_password(&options.user, pass, &md5_body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    return Err(anyhow!("SASL authentication not supported"));
                }
                backend::Message::ErrorResponse(_) => {
                    return Err(parse_error_response(&body).into());
                }
                _ => return Err(anyhow!("unexpected message during auth: {}", type_code)),
            }
        }

        // 3. Wait for ReadyForQuery
        loop {
            let (type_code, body) = read_raw_message(&mut stream).await?;
            match type_code {
                b'Z' => {
                    debug!("ready for query");
                    break;
                }
                b'E' => return Err(parse_error_response(&body).into()),
                _ => {}
            }
        }

        Ok(Self { stream })
    }

    /// Start streaming replication from `start_lsn`.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        start_lsn: Lsn,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {slot_name} LOGICAL {start_lsn} \
             (proto_version '1', publication_names '{publication}')"
        );

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        // Expect CopyBothResponse ('W')
        let (type_code, body) = read_raw_message(&mut self.stream).await?;
        match type_code {
            b'W' => {
                info!("entered CopyBoth mode on slot {slot_name}");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => Err(parse_error_response(&body).into()),
            _ => Err(anyhow!(
                "unexpected response to START_REPLICATION: {}",
                type_code as char
            )),
        }
    }
}

async fn read_raw_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let type_code = stream.read_u8().await.context("failed to read type")?;
    let len = stream.read_i32().await.context("failed to read len")? as usize;
    if len < 4 {
        return Err(anyhow!("invalid message length"));
    }
    let mut body = vec![0u8; len - 4];
    stream
        .read_exact(&mut body)
        .await
        .context("failed to read body")?;
    Ok((type_code, body))
}

/// Replication stream in CopyBoth mode
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Get next replication frame.
    ///
    /// Returns:
    /// - `Ok(Some(Bytes))`: raw CopyData payload
    /// - `Ok(None)`: end of stream (CopyDone)
    pub async fn next_message(&mut self) -> Result<Option<Bytes>> {
        let (type_code, body) = read_raw_message(&mut self.stream).await?;
        match type_code {
            b'd' => Ok(Some(Bytes::from(body))), // CopyData
            b'c' => Ok(None),                    // CopyDone
            b'E' => Err(parse_error_response(&body).into()),
            _ => Err(anyhow!(
                "unexpected message type in stream: {}",
                type_code as char
            )),
        }
    }

    /// Send a StandbyStatusUpdate.
    ///
    /// Written, flushed and applied positions are all the last acked LSN;
    /// the timestamp is microseconds since the PostgreSQL epoch
    /// (2000-01-01 UTC).
    pub async fn send_status_update(&mut self, acked: Lsn, request_reply: bool) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(acked.0);
        payload.put_u64(acked.0);
        payload.put_u64(acked.0);
        payload.put_i64(pg_epoch_micros());
        payload.put_u8(u8::from(request_reply));

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        debug!("sent status update, acked {acked}");
        Ok(())
    }
}

/// Microseconds since 2000-01-01 00:00:00 UTC (TIMESTAMPTZ origin).
fn pg_epoch_micros() -> i64 {
    let pg_epoch = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(946_684_800);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn hash_md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let first = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(salt);
    let second = hex::encode(hasher.finalize());

    format!("md5{second}")
}
