//! In-process RESP server used by the integration tests.
//!
//! Each accepted connection is a "session" that answers a fixed number of
//! commands (or until EOF) and then closes, which lets tests script
//! disconnects.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use muxkv_client::{BacklogPolicy, MuxConfig};

/// Commands a session answers before hanging up.
#[derive(Debug, Clone, Copy)]
pub enum Session {
    Commands(usize),
    UntilEof,
    /// Reads commands until EOF without ever replying.
    Silent,
}

/// Shared view of what the fake server received, in order.
#[derive(Clone, Default)]
pub struct Journal {
    commands: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
}

impl Journal {
    pub fn names(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|args| {
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    fn record(&self, args: &[Vec<u8>]) {
        self.commands.lock().unwrap().push(args.to_vec());
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Returns an address nothing is listening on.
pub fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr")
}

pub fn spawn_server(sessions: Vec<Session>) -> (SocketAddr, Journal) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    serve(listener, sessions)
}

pub fn spawn_server_on(addr: SocketAddr, sessions: Vec<Session>) -> Journal {
    let listener = TcpListener::bind(addr).expect("bind");
    serve(listener, sessions).1
}

fn serve(listener: TcpListener, sessions: Vec<Session>) -> (SocketAddr, Journal) {
    let addr = listener.local_addr().expect("addr");
    let journal = Journal::default();
    let recorder = journal.clone();
    thread::spawn(move || {
        let mut store = Store::default();
        for session in sessions {
            let (mut stream, _) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let limit = match session {
                Session::Commands(count) => count,
                Session::UntilEof | Session::Silent => usize::MAX,
            };
            let replies = !matches!(session, Session::Silent);
            let mut served = 0;
            while served < limit {
                let args = match read_command(&mut reader) {
                    Ok(args) => args,
                    Err(_) => break,
                };
                recorder.record(&args);
                if !replies {
                    continue;
                }
                let reply = store.apply(&args);
                if stream.write_all(&reply).and_then(|_| stream.flush()).is_err() {
                    break;
                }
                served += 1;
            }
        }
    });
    (addr, journal)
}

pub fn config(addr: SocketAddr, policy: BacklogPolicy) -> MuxConfig {
    MuxConfig {
        addr: addr.to_string(),
        connections: 1,
        backlog_policy: policy,
        write_lock_timeout_ms: 1_000,
        sync_timeout_ms: 2_000,
        async_timeout_ms: 2_000,
        heartbeat_interval_ms: 20,
        reconnect_interval_ms: 20,
        connect_timeout_ms: Some(1_000),
    }
}

#[derive(Default)]
struct Store {
    values: HashMap<Vec<u8>, (Vec<u8>, Option<u64>)>,
}

impl Store {
    fn apply(&mut self, args: &[Vec<u8>]) -> Vec<u8> {
        let name = args
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
            .unwrap_or_default();
        match (name.as_str(), args.len()) {
            ("PING", 1) => b"+PONG\r\n".to_vec(),
            ("PING", 2) | ("ECHO", 2) => bulk(&args[1]),
            ("INFO", _) => bulk(b"# Server\r\nrole:fake\r\n"),
            ("SET", 3) => {
                self.values.insert(args[1].clone(), (args[2].clone(), None));
                b"+OK\r\n".to_vec()
            }
            ("SET", 5) => {
                let seconds = parse_u64(&args[4]);
                self.values.insert(args[1].clone(), (args[2].clone(), Some(seconds)));
                b"+OK\r\n".to_vec()
            }
            ("GET", 2) => match self.values.get(&args[1]) {
                Some((value, _)) => bulk(value),
                None => b"$-1\r\n".to_vec(),
            },
            ("DEL", 2) => integer(self.values.remove(&args[1]).is_some() as i64),
            ("EXPIRE", 3) => match self.values.get_mut(&args[1]) {
                Some(entry) => {
                    entry.1 = Some(parse_u64(&args[2]));
                    integer(1)
                }
                None => integer(0),
            },
            ("TTL", 2) => match self.values.get(&args[1]) {
                Some((_, Some(seconds))) => integer(*seconds as i64),
                Some((_, None)) => integer(-1),
                None => integer(-2),
            },
            _ => format!("-ERR unknown command '{}'\r\n", name).into_bytes(),
        }
    }
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn integer(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

fn parse_u64(data: &[u8]) -> u64 {
    String::from_utf8_lossy(data).parse().unwrap_or(0)
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"))
}
