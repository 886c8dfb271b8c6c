//! In-process stand-in for nats-server.
//!
//! Speaks enough of the client protocol for session tests that must not need
//! a real server: the INFO/CONNECT/PING handshake, SUB and UNSUB, PUB and
//! HPUB routed with `*` and `>` wildcards, and the 503 status a publisher
//! gets when a request has no responders.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const NO_RESPONDERS: &[u8] = b"NATS/1.0 503\r\n\r\n";

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// answer the handshake, then ignore every command
    pub mute: bool,
    /// CONNECT must carry this `auth_token`
    pub token: Option<String>,
}

struct Route {
    conn: u64,
    sid: String,
    filter: String,
    out: mpsc::UnboundedSender<Vec<u8>>,
}

type Routes = Arc<Mutex<Vec<Route>>>;

pub struct FakeServer {
    addr: SocketAddr,
    kick: watch::Sender<u64>,
    accept: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Result<Self> {
        Self::with_options(Options::default()).await
    }

    pub async fn with_options(options: Options) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (kick, kicked) = watch::channel(0u64);
        let routes = Routes::default();

        let accept = tokio::spawn(async move {
            let mut next_id = 0;
            while let Ok((stream, _)) = listener.accept().await {
                next_id += 1;
                let conn = Conn {
                    id: next_id,
                    port: addr.port(),
                    options: options.clone(),
                    routes: routes.clone(),
                };
                let mut kicked = kicked.clone();
                // only kicks from now on count for this connection
                kicked.borrow_and_update();
                tokio::spawn(async move {
                    if let Err(err) = conn.serve(stream, kicked).await {
                        eprintln!("fake server connection ended: {err:#}");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            kick,
            accept,
        })
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    /// Drop every open client connection. New connections are still accepted.
    pub fn kick(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

struct Conn {
    id: u64,
    port: u16,
    options: Options,
    routes: Routes,
}

impl Conn {
    async fn serve(self, stream: TcpStream, mut kicked: watch::Receiver<u64>) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let (out, mut outbox) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbox.recv().await {
                if write.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        out.send(self.info())?;
        let mut reader = BufReader::new(read);
        let mut greeted = false;
        let result = loop {
            let mut line = String::new();
            let read = tokio::select! {
                // a dropped server counts as a kick
                _ = kicked.changed() => break Ok(()),
                read = reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(err) => break Err(err.into()),
            }
            let muted = self.options.mute && greeted;
            match self.handle(line.trim_end(), &mut reader, &out, muted).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Greeted) => greeted = true,
                Ok(Flow::Close) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.routes
            .lock()
            .expect("routes poisoned")
            .retain(|r| r.conn != self.id);
        drop(out);
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        result
    }

    fn info(&self) -> Vec<u8> {
        let info = json!({
            "server_id": "FAKE",
            "server_name": "fake",
            "version": "2.10.0",
            "go": "go1.22",
            "host": "127.0.0.1",
            "port": self.port,
            "headers": true,
            "auth_required": self.options.token.is_some(),
            "max_payload": 1_048_576,
            "proto": 1,
            "client_id": self.id,
        });
        format!("INFO {info}\r\n").into_bytes()
    }

    async fn handle(
        &self,
        line: &str,
        reader: &mut BufReader<OwnedReadHalf>,
        out: &mpsc::UnboundedSender<Vec<u8>>,
        muted: bool,
    ) -> Result<Flow> {
        let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();
        match op.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                let connect: Value = serde_json::from_str(rest).context("CONNECT json")?;
                if let Some(expected) = &self.options.token {
                    if connect.get("auth_token").and_then(Value::as_str) != Some(expected) {
                        out.send(b"-ERR 'Authorization Violation'\r\n".to_vec())?;
                        return Ok(Flow::Close);
                    }
                }
            }
            "PING" => {
                if !muted {
                    out.send(b"PONG\r\n".to_vec())?;
                }
                return Ok(Flow::Greeted);
            }
            "PONG" => {}
            "SUB" => {
                let (filter, sid) = match args.as_slice() {
                    [filter, sid] | [filter, _, sid] => (*filter, *sid),
                    _ => bail!("bad SUB: {line}"),
                };
                if !muted {
                    self.routes.lock().expect("routes poisoned").push(Route {
                        conn: self.id,
                        sid: sid.to_owned(),
                        filter: filter.to_owned(),
                        out: out.clone(),
                    });
                }
            }
            "UNSUB" => {
                let sid = args.first().context("bad UNSUB")?;
                self.routes
                    .lock()
                    .expect("routes poisoned")
                    .retain(|r| !(r.conn == self.id && r.sid == *sid));
            }
            "PUB" => {
                let (subject, reply, size) = match args.as_slice() {
                    [subject, size] => (*subject, None, *size),
                    [subject, reply, size] => (*subject, Some(*reply), *size),
                    _ => bail!("bad PUB: {line}"),
                };
                let body = read_body(reader, size.parse()?).await?;
                if !muted {
                    self.route(subject, reply, None, &body);
                }
            }
            "HPUB" => {
                let (subject, reply, header_size, size) = match args.as_slice() {
                    [subject, hdr, size] => (*subject, None, *hdr, *size),
                    [subject, reply, hdr, size] => (*subject, Some(*reply), *hdr, *size),
                    _ => bail!("bad HPUB: {line}"),
                };
                let body = read_body(reader, size.parse()?).await?;
                if !muted {
                    self.route(subject, reply, Some(header_size.parse()?), &body);
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    fn route(&self, subject: &str, reply: Option<&str>, header_size: Option<usize>, body: &[u8]) {
        let routes = self.routes.lock().expect("routes poisoned");
        let mut delivered = false;
        for route in routes.iter().filter(|r| subject_matches(&r.filter, subject)) {
            let _ = route
                .out
                .send(frame(subject, &route.sid, reply, header_size, body));
            delivered = true;
        }
        let Some(reply) = reply else { return };
        if delivered {
            return;
        }
        // the publisher gets a 503 status on its reply inbox
        for route in routes
            .iter()
            .filter(|r| r.conn == self.id && subject_matches(&r.filter, reply))
        {
            let _ = route.out.send(frame(
                reply,
                &route.sid,
                None,
                Some(NO_RESPONDERS.len()),
                NO_RESPONDERS,
            ));
        }
    }
}

enum Flow {
    Continue,
    Greeted,
    Close,
}

async fn read_body(reader: &mut BufReader<OwnedReadHalf>, size: usize) -> Result<Vec<u8>> {
    let mut body = vec![0; size + 2];
    reader.read_exact(&mut body).await?;
    body.truncate(size);
    Ok(body)
}

fn frame(
    subject: &str,
    sid: &str,
    reply: Option<&str>,
    header_size: Option<usize>,
    body: &[u8],
) -> Vec<u8> {
    let reply = reply.map(|r| format!(" {r}")).unwrap_or_default();
    let head = match header_size {
        Some(hdr) => format!("HMSG {subject} {sid}{reply} {hdr} {}\r\n", body.len()),
        None => format!("MSG {subject} {sid}{reply} {}\r\n", body.len()),
    };
    let mut frame = head.into_bytes();
    frame.extend_from_slice(body);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// NATS subject matching: `*` matches one token, `>` the rest.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter = filter.split('.');
    let mut subject = subject.split('.');
    loop {
        match (filter.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
