//! MTProto auth key exchange + encrypted ping against a pylon server.
//!
//! # What this does
//!
//! 1. TCP connect (abridged framing, or obfuscated with `--obfuscated`)
//! 2. **Step 1**: send `req_pq_multi`
//! 3. **Step 2**: receive `resPQ`, factorize pq, RSA_PAD-encrypt → `req_DH_params`
//! 4. **Step 3**: receive `server_DH_params_ok`, complete DH → `set_client_DH_params`
//! 5. **Finish**: receive `dh_gen_ok`, derive the `AuthKey`
//! 6. Send `ping` and `get_future_salts` encrypted, acknowledge what comes back
//!
//! # Run
//! ```text
//! cargo run -p pylon-connect -- server.pem 127.0.0.1:8443
//! ```
//!
//! `server.pem` is the PKCS#1 public key the server prints at startup.

use std::time::Duration;

use pylon_crypto::rsa::PublicKey;
use pylon_mtproto::client::{self, ClientSession, Outcome};
use pylon_mtproto::message_id::ClientMessageIds;
use pylon_mtproto::transport::{self, ClientMode, FrameReader, FrameWriter, Framing};
use pylon_mtproto::{PlainMessage, service};
use pylon_tl::{Call, Object, SchemaSet, Value};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const DEFAULT_ADDR: &str = "127.0.0.1:8443";

/// How long to wait for any single server frame.
const READ_TIMEOUT: Duration = Duration::from_secs(15);

type Error = Box<dyn std::error::Error>;

// ── Arguments ────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
struct Args {
    key_path: String,
    addr: String,
    obfuscated: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut obfuscated = false;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--obfuscated" => obfuscated = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            _ => positional.push(arg),
        }
    }
    let mut positional = positional.into_iter();
    let key_path = positional.next().ok_or("usage: connect <server.pem> [addr] [--obfuscated]")?;
    let addr = positional.next().unwrap_or_else(|| DEFAULT_ADDR.to_owned());
    Ok(Args { key_path, addr, obfuscated })
}

// ── Wire helpers ─────────────────────────────────────────────────────────────

struct Conn {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    set: SchemaSet,
    msg_ids: ClientMessageIds,
}

impl Conn {
    async fn recv(&mut self) -> Result<Vec<u8>, Error> {
        let frame = tokio::time::timeout(READ_TIMEOUT, self.reader.read_frame())
            .await
            .map_err(|_| "timed out waiting for the server")??
            .ok_or("server closed the connection")?;
        if let Some(code) = transport::transport_error(&frame) {
            return Err(format!("transport error {code}").into());
        }
        Ok(frame)
    }

    async fn plain_call(&mut self, call: Call) -> Result<Object, Error> {
        let body = self.set.dump(&call.into())?;
        self.writer.write_frame(&PlainMessage::new(self.msg_ids.next(), body).to_bytes()).await?;

        let frame = self.recv().await?;
        let message = PlainMessage::from_bytes(&frame)?;
        match self.set.load(&message.body)?.0 {
            Value::Object(o) => Ok(*o),
            other => Err(format!("expected an object, got {}", other.kind()).into()),
        }
    }

    async fn send(&mut self, session: &mut ClientSession, value: Value) -> Result<i64, Error> {
        let content_related = value.name().is_none_or(service::is_content_related);
        let body = self.set.dump(&value)?;
        let (frame, msg_id) = session.pack(&body, content_related);
        self.writer.write_frame(&frame).await?;
        Ok(msg_id)
    }

    /// Reads one encrypted frame, flattening containers.
    async fn recv_encrypted(&mut self, session: &ClientSession) -> Result<Vec<(i64, Object)>, Error> {
        let frame = self.recv().await?;
        let message = session.unpack(&frame)?;
        let (value, _) = self.set.load(&message.body)?;
        let object = value.as_object().cloned().ok_or("expected an object")?;
        if object.name != "msg_container" {
            return Ok(vec![(message.msg_id, object)]);
        }

        let mut out = Vec::new();
        for entry in object.vector("messages").unwrap_or_default() {
            let Some(entry) = entry.as_object() else { continue };
            let (Some(msg_id), Some(body)) = (entry.long("msg_id"), entry.bytes("body")) else { continue };
            if let Some(inner) = self.set.load(body)?.0.as_object() {
                out.push((msg_id, inner.clone()));
            }
        }
        Ok(out)
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("pylon_mtproto=info")).init();
    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let args = parse_args(std::env::args().skip(1))?;
    let key = PublicKey::from_pkcs1_pem(&std::fs::read_to_string(&args.key_path)?)?;
    println!("Server key fingerprint {:016x}", key.fingerprint());

    // ── 1. Connect ────────────────────────────────────────────────────────────
    println!("Connecting to {} …", args.addr);
    let stream = TcpStream::connect(&args.addr).await?;
    stream.set_nodelay(true)?;
    let (r, w) = stream.into_split();
    let mode = if args.obfuscated {
        ClientMode::Obfuscated { framing: Framing::Intermediate, secret: None }
    } else {
        ClientMode::Plain(Framing::Abridged)
    };
    let (reader, writer) = transport::connect(r, w, mode).await?;
    let mut conn = Conn { reader, writer, set: service::schema_set(None)?, msg_ids: ClientMessageIds::new() };
    println!("✓ TCP connected ({mode:?})");

    // ── 2. Auth key: step 1, req_pq_multi ────────────────────────────────────
    let (req1, state1) = client::step1();
    println!("\n[Step 1] Sending req_pq_multi …");
    let res_pq = conn.plain_call(req1).await?;
    println!("  ✓ resPQ: pq={:02x?}", res_pq.bytes("pq").unwrap_or_default());

    // ── 3. Auth key: step 2, req_DH_params ───────────────────────────────────
    let (req2, state2) = client::step2(state1, &res_pq, &[key])?;
    println!("[Step 2] Sending req_DH_params …");
    let params = conn.plain_call(req2).await?;
    println!("  ✓ {}", params.name);

    // ── 4. Auth key: step 3, set_client_DH_params ────────────────────────────
    let (mut req3, mut state3) = client::step3(state2, &params)?;
    let done = loop {
        println!("[Step 3] Sending set_client_DH_params …");
        let answer = conn.plain_call(req3).await?;
        match client::finish(state3, &answer)? {
            Outcome::Done(done) => break done,
            Outcome::Retry(state) => {
                println!("  ⚠ dh_gen_retry, trying again");
                (req3, state3) = client::retry(state)?;
            }
        }
    };

    // ── 5. Derived auth key ───────────────────────────────────────────────────
    println!("\n✓ Auth key derived!");
    println!("  time_offset = {}s", done.time_offset);
    println!("  first_salt  = {}", done.first_salt);
    println!("  auth_key_id = {:016x}", done.auth_key.id());

    // ── 6. Encrypted session: ping + get_future_salts ─────────────────────────
    let mut session = ClientSession::new(done.auth_key, done.first_salt);
    let ping_id = i64::from_le_bytes(pylon_crypto::random_array());
    println!("\n[Encrypted] ping {ping_id} …");
    let ping = conn.send(&mut session, Call::new("ping").with("ping_id", ping_id).into()).await?;
    let salts = conn.send(&mut session, Call::new("get_future_salts").with("num", 2).into()).await?;

    let (mut got_pong, mut got_salts) = (false, false);
    while !(got_pong && got_salts) {
        let messages = conn.recv_encrypted(&session).await?;
        let mut acks = Vec::new();
        for (msg_id, object) in messages {
            acks.push(msg_id);
            match object.name.as_str() {
                "pong" if object.long("msg_id") == Some(ping) => {
                    println!("  ✓ pong {}", object.long("ping_id").unwrap_or_default());
                    got_pong = true;
                }
                "future_salts" if object.long("req_msg_id") == Some(salts) => {
                    for salt in object.vector("salts").unwrap_or_default().iter().filter_map(Value::as_object) {
                        println!(
                            "  ✓ salt {:016x} valid {}..{}",
                            salt.long("salt").unwrap_or_default(),
                            salt.int("valid_since").unwrap_or_default(),
                            salt.int("valid_until").unwrap_or_default(),
                        );
                    }
                    got_salts = true;
                }
                "new_session_created" => println!("  ✓ new session, server_salt={}", object.long("server_salt").unwrap_or_default()),
                "bad_server_salt" => {
                    let salt = object.long("new_server_salt").unwrap_or_default();
                    return Err(format!("server rejected our salt, it wants {salt}").into());
                }
                other => log::debug!("[connect] ignoring {other}"),
            }
        }
        conn.send(&mut session, service::msgs_ack(acks).into()).await?;
    }

    println!("\n✓ Full MTProto flow complete!");
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn key_path_is_required() {
        assert!(args(&[]).is_err());
    }

    #[test]
    fn address_defaults_to_localhost() {
        let parsed = args(&["server.pem"]).unwrap();
        assert_eq!(parsed, Args { key_path: "server.pem".into(), addr: DEFAULT_ADDR.into(), obfuscated: false });
    }

    #[test]
    fn flags_mix_with_positionals() {
        let parsed = args(&["--obfuscated", "k.pem", "10.0.0.1:443"]).unwrap();
        assert!(parsed.obfuscated);
        assert_eq!(parsed.addr, "10.0.0.1:443");
        assert!(args(&["k.pem", "--verbose"]).is_err());
    }
}
