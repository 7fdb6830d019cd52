#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use redwire::resp::{self, RespValue};
use redwire::{ConnectionConfig, ServerAddress};

/// A scripted stand-in for a Redis server: enough of the command surface
/// to exercise the client end-to-end without a real redis-server.
pub struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    publish_tx: broadcast::Sender<(Bytes, Bytes)>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with_password(None).await
    }

    /// With a password set, commands other than AUTH/QUIT are rejected
    /// until a matching AUTH arrives.
    pub async fn start_with_password(password: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (publish_tx, _) = broadcast::channel(64);
        let password = password.map(|p| p.to_string());
        let kv: Arc<Mutex<HashMap<Bytes, Bytes>>> = Arc::new(Mutex::new(HashMap::new()));

        let accepted_in_loop = accepted.clone();
        let publish_in_loop = publish_tx.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accepted_in_loop.fetch_add(1, Ordering::SeqCst);
                let kv = kv.clone();
                let password = password.clone();
                let publishes = publish_in_loop.subscribe();
                tokio::spawn(async move {
                    handle_connection(stream, kv, password, publishes).await;
                });
            }
        });

        Self {
            addr,
            accepted,
            publish_tx,
        }
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress::tcp("127.0.0.1", self.addr.port())
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.address())
    }

    /// Connections accepted so far.
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Deliver a message to every connection subscribed to `channel`
    /// (directly or through a matching pattern).
    pub fn publish(&self, channel: &str, payload: &str) {
        let _ = self.publish_tx.send((
            Bytes::copy_from_slice(channel.as_bytes()),
            Bytes::copy_from_slice(payload.as_bytes()),
        ));
    }
}

/// Poll `cond` for up to two seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn read_one_frame<R>(read: &mut R, buf: &mut BytesMut) -> Option<RespValue>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = resp::decode(buf).expect("client sent malformed RESP") {
            return Some(frame);
        }
        let n = read.read_buf(buf).await.ok()?;
        if n == 0 {
            return None;
        }
    }
}

async fn write_value<W>(write: &mut W, value: &RespValue) -> bool
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    resp::encode(value, &mut out);
    write.write_all(&out).await.is_ok()
}

fn ok() -> RespValue {
    RespValue::simple_string("OK")
}

fn command_parts(frame: &RespValue) -> Option<(String, Vec<Bytes>)> {
    let RespValue::Array(items) = frame else {
        return None;
    };
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(Bytes::copy_from_slice(item.as_bytes()?));
    }
    let keyword = parts.first()?.iter().map(|b| b.to_ascii_uppercase() as char).collect();
    Some((keyword, parts.split_off(1)))
}

/// `*` matches any run of characters; everything else is literal.
fn pattern_matches(pattern: &[u8], channel: &[u8]) -> bool {
    match pattern.iter().position(|&b| b == b'*') {
        None => pattern == channel,
        Some(at) => {
            let (prefix, suffix) = (&pattern[..at], &pattern[at + 1..]);
            channel.len() >= prefix.len() + suffix.len()
                && channel.starts_with(prefix)
                && channel.ends_with(suffix)
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    kv: Arc<Mutex<HashMap<Bytes, Bytes>>>,
    password: Option<String>,
    mut publishes: broadcast::Receiver<(Bytes, Bytes)>,
) {
    let (mut read, mut write) = stream.split();
    let mut buf = BytesMut::new();
    let mut authenticated = password.is_none();
    let mut channels: Vec<Bytes> = Vec::new();
    let mut patterns: Vec<Bytes> = Vec::new();

    loop {
        tokio::select! {
            frame = read_one_frame(&mut read, &mut buf) => {
                let Some(frame) = frame else { return };
                let Some((keyword, args)) = command_parts(&frame) else {
                    let _ = write_value(&mut write, &RespValue::Error(
                        "ERR Protocol error: expected a command array".into(),
                    )).await;
                    return;
                };

                if !authenticated && !matches!(keyword.as_str(), "AUTH" | "QUIT") {
                    write_value(&mut write, &RespValue::Error(
                        "NOAUTH Authentication required.".into(),
                    )).await;
                    continue;
                }

                match keyword.as_str() {
                    "AUTH" => {
                        let given = args.last().map(|b| b.as_ref().to_vec());
                        let wanted = password.as_ref().map(|p| p.as_bytes().to_vec());
                        if wanted.is_none() || given == wanted {
                            authenticated = true;
                            write_value(&mut write, &ok()).await;
                        } else {
                            write_value(&mut write, &RespValue::Error(
                                "WRONGPASS invalid username-password pair".into(),
                            )).await;
                        }
                    }
                    "SELECT" => {
                        write_value(&mut write, &ok()).await;
                    }
                    "PING" => {
                        write_value(&mut write, &RespValue::simple_string("PONG")).await;
                    }
                    "ECHO" => {
                        let payload = args.first().cloned().unwrap_or_default();
                        write_value(&mut write, &RespValue::BulkString(Some(payload))).await;
                    }
                    "SET" => {
                        if let (Some(key), Some(value)) = (args.first(), args.get(1)) {
                            kv.lock().unwrap().insert(key.clone(), value.clone());
                            write_value(&mut write, &ok()).await;
                        } else {
                            write_value(&mut write, &RespValue::Error(
                                "ERR wrong number of arguments for 'set' command".into(),
                            )).await;
                        }
                    }
                    "GET" => {
                        let value = args
                            .first()
                            .and_then(|key| kv.lock().unwrap().get(key).cloned());
                        let reply = match value {
                            Some(v) => RespValue::BulkString(Some(v)),
                            None => RespValue::Null,
                        };
                        write_value(&mut write, &reply).await;
                    }
                    "SUBSCRIBE" => {
                        for target in args {
                            if !channels.contains(&target) {
                                channels.push(target.clone());
                            }
                            let count = (channels.len() + patterns.len()) as i64;
                            write_value(&mut write, &subscription_ack("subscribe", &target, count)).await;
                        }
                    }
                    "PSUBSCRIBE" => {
                        for target in args {
                            if !patterns.contains(&target) {
                                patterns.push(target.clone());
                            }
                            let count = (channels.len() + patterns.len()) as i64;
                            write_value(&mut write, &subscription_ack("psubscribe", &target, count)).await;
                        }
                    }
                    "UNSUBSCRIBE" => {
                        let targets = if args.is_empty() { channels.clone() } else { args };
                        for target in targets {
                            channels.retain(|c| c != &target);
                            let count = (channels.len() + patterns.len()) as i64;
                            write_value(&mut write, &subscription_ack("unsubscribe", &target, count)).await;
                        }
                    }
                    "PUNSUBSCRIBE" => {
                        let targets = if args.is_empty() { patterns.clone() } else { args };
                        for target in targets {
                            patterns.retain(|p| p != &target);
                            let count = (channels.len() + patterns.len()) as i64;
                            write_value(&mut write, &subscription_ack("punsubscribe", &target, count)).await;
                        }
                    }
                    "QUIT" => {
                        write_value(&mut write, &ok()).await;
                        return;
                    }
                    // drop the connection on the floor, mid-pipeline
                    "BOOM" => {
                        return;
                    }
                    other => {
                        write_value(&mut write, &RespValue::Error(
                            format!("ERR unknown command '{other}'"),
                        )).await;
                    }
                }
            }
            published = publishes.recv() => {
                let Ok((channel, payload)) = published else { continue };
                if channels.contains(&channel) {
                    let frame = RespValue::Array(vec![
                        RespValue::bulk_string("message"),
                        RespValue::BulkString(Some(channel.clone())),
                        RespValue::BulkString(Some(payload.clone())),
                    ]);
                    if !write_value(&mut write, &frame).await {
                        return;
                    }
                }
                for pattern in &patterns {
                    if pattern_matches(pattern, &channel) {
                        let frame = RespValue::Array(vec![
                            RespValue::bulk_string("pmessage"),
                            RespValue::BulkString(Some(pattern.clone())),
                            RespValue::BulkString(Some(channel.clone())),
                            RespValue::BulkString(Some(payload.clone())),
                        ]);
                        if !write_value(&mut write, &frame).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn subscription_ack(keyword: &str, subject: &Bytes, count: i64) -> RespValue {
    RespValue::Array(vec![
        RespValue::bulk_string(keyword),
        RespValue::BulkString(Some(subject.clone())),
        RespValue::Integer(count),
    ])
}
