use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::{Events, Poll, PollOpt, Ready, Token};
use slab::Slab;

use crate::acl::Acl;
use crate::buffer::{RingBuffer, DEFAULT_BUF_SIZE};
use crate::error::{Error, Result};
use crate::listen::Listener;
use crate::net::PeerAddr;
use crate::net::Stream;

// Listener sockets take the low tokens; client slots start here.
const SLOT_BASE: usize = 16;

/// Work cap per client per tick: a flooder may not occupy the loop for
/// more than this many complete lines before other slots are serviced.
pub const MAX_LINES_PER_TICK: usize = 100;

// A single inbound line may hoard at most this much before it is
// forwarded as-is.
const LINE_MAX: usize = 8 * 1024;

// A slot whose outbound buffer has been overflowing for this long is
// disconnected rather than throttling everyone else.
const SLOW_DISCONNECT: Duration = Duration::from_secs(10);

const TICK: Duration = Duration::from_millis(250);
const NICK_PROMPT: &[u8] = b"Nickname: ";

struct ClientSlot {
    id: u32,
    stream: Stream,
    peer: PeerAddr,
    nickname: Option<String>,
    last_activity: Instant,
    out: RingBuffer,
    inbuf: Vec<u8>,
    slow_since: Option<Instant>,
    disconnecting: bool,
}

/// Fan-out relay: every byte a client sends is forwarded to every other
/// live client, never echoed back. Chat mode adds nicknames, join/part
/// notices, and line prefixing on top of the same loop.
///
/// All pool state lives on the loop thread; a slot's stream is only ever
/// touched by the iteration that holds it.
pub struct Broker {
    chat: bool,
    max_conns: usize,
    acl: Acl,
    cancel: Arc<AtomicBool>,
    next_id: u32,
    slots: Slab<ClientSlot>,
    nicknames: HashMap<String, usize>,
}

impl Broker {
    pub fn new(chat: bool, max_conns: usize, acl: Acl, cancel: Arc<AtomicBool>) -> Broker {
        Broker {
            chat,
            max_conns,
            acl,
            cancel,
            next_id: 0,
            slots: Slab::new(),
            nicknames: HashMap::new(),
        }
    }

    /// Run the relay until cancellation. Per-client errors only ever cost
    /// that client its slot; the server stays up.
    pub fn run(&mut self, listener: &mut Listener) -> Result<()> {
        let poll = Poll::new().map_err(Error::from)?;
        listener.register(&poll, 0).map_err(Error::from)?;
        let listener_count = listener.socket_count();
        let mut events = Events::with_capacity(64);

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                info!("relay shutting down ({} clients)", self.slots.len());
                self.slots.clear();
                self.nicknames.clear();
                return Ok(());
            }

            // Interest tracks buffer state: no read interest for a slot
            // being torn down, no write interest once drained.
            let mut backlog = false;
            for (key, slot) in self.slots.iter() {
                let mut interest = Ready::empty();
                if !slot.disconnecting && slot.inbuf.len() < LINE_MAX {
                    interest |= Ready::readable();
                }
                if !slot.out.is_empty() {
                    interest |= Ready::writable();
                }
                poll.reregister(&slot.stream, Token(SLOT_BASE + key), interest, PollOpt::level())?;
                if self.chat && !slot.disconnecting && find_line(&slot.inbuf).is_some() {
                    // Over-cap lines from the last tick still wait.
                    backlog = true;
                }
            }

            let timeout = if backlog { Duration::from_millis(0) } else { TICK };
            poll.poll(&mut events, Some(timeout)).map_err(Error::from)?;

            for idx in 0..listener_count {
                self.accept_pending(listener, idx, &poll)?;
            }

            let keys: Vec<usize> = self.slots.iter().map(|(k, _)| k).collect();
            for key in keys {
                self.service_slot(key);
            }
            self.reap(&poll);
        }
    }

    fn accept_pending(&mut self, listener: &mut Listener, idx: usize, poll: &Poll) -> Result<()> {
        loop {
            let accepted = match listener.accept(idx, &self.acl)? {
                Some(a) => a,
                None => return Ok(()),
            };
            if self.slots.len() >= self.max_conns {
                warn!(
                    "connection from {} dropped: at the {}-client limit",
                    accepted.peer, self.max_conns
                );
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut slot = ClientSlot {
                id,
                stream: accepted.stream,
                peer: accepted.peer,
                nickname: None,
                last_activity: Instant::now(),
                out: RingBuffer::with_capacity(DEFAULT_BUF_SIZE),
                inbuf: Vec::new(),
                slow_since: None,
                disconnecting: false,
            };
            if self.chat {
                slot.out.push_slice(NICK_PROMPT);
            }
            let key = self.slots.insert(slot);
            let slot = &self.slots[key];
            debug!("client #{} joined from {}", id, slot.peer);
            poll.register(
                &slot.stream,
                Token(SLOT_BASE + key),
                Ready::readable() | Ready::writable(),
                PollOpt::level(),
            )?;
        }
    }

    /// One tick's worth of work for one slot: at most one read, at most
    /// `MAX_LINES_PER_TICK` chat lines, one write attempt.
    fn service_slot(&mut self, key: usize) {
        let mut scratch = [0u8; 4096];

        // Read phase. One chunk per tick; level triggering re-delivers
        // whatever the kernel still holds.
        let mut fresh: Option<Vec<u8>> = None;
        {
            let slot = &mut self.slots[key];
            if !slot.disconnecting && slot.inbuf.len() < LINE_MAX {
                match slot.stream.read(&mut scratch) {
                    Ok(0) => slot.disconnecting = true,
                    Ok(n) => {
                        slot.last_activity = Instant::now();
                        fresh = Some(scratch[..n].to_vec());
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!("client #{} read error: {}", slot.id, e);
                        slot.disconnecting = true;
                    }
                }
            }
        }

        if let Some(bytes) = fresh {
            if self.chat {
                self.slots[key].inbuf.extend_from_slice(&bytes);
            } else {
                self.broadcast_from(key, &bytes);
            }
        }

        if self.chat {
            let mut processed = 0;
            while processed < MAX_LINES_PER_TICK {
                let line = {
                    let slot = &mut self.slots[key];
                    if slot.disconnecting {
                        break;
                    }
                    match find_line(&slot.inbuf) {
                        Some(pos) => {
                            let mut line: Vec<u8> = slot.inbuf.drain(..=pos).collect();
                            line.pop();
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            line
                        }
                        None if slot.inbuf.len() >= LINE_MAX => {
                            slot.inbuf.drain(..).collect()
                        }
                        None => break,
                    }
                };
                processed += 1;
                self.handle_chat_line(key, line);
            }
        }

        // Write phase.
        let slot = &mut self.slots[key];
        if !slot.out.is_empty() {
            match slot.out.write_to(&mut slot.stream) {
                Ok(0) => {}
                Ok(_) => {
                    slot.last_activity = Instant::now();
                    if slot.out.is_empty() {
                        slot.slow_since = None;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("client #{} write error: {}", slot.id, e);
                    slot.disconnecting = true;
                }
            }
        }
    }

    fn handle_chat_line(&mut self, key: usize, line: Vec<u8>) {
        if self.slots[key].nickname.is_none() {
            if line.is_empty() {
                self.send_to(key, NICK_PROMPT);
                return;
            }
            let name = String::from_utf8_lossy(&line).into_owned();
            match self.admit_nickname(key, &name) {
                Ok(()) => {
                    let notice = format!("*** {} has joined\n", name);
                    self.broadcast_from(key, notice.as_bytes());
                }
                Err(reason) => {
                    let msg = format!("nickname rejected: {}\n", reason);
                    self.send_to(key, msg.as_bytes());
                    self.send_to(key, NICK_PROMPT);
                }
            }
            return;
        }

        let text = String::from_utf8_lossy(&line).into_owned();
        let rename = text
            .strip_prefix("/nick ")
            .or_else(|| text.strip_prefix("/name "))
            .map(|s| s.to_string());
        if let Some(new_name) = rename {
            let old = self.slots[key].nickname.clone().unwrap_or_default();
            match self.admit_nickname(key, &new_name) {
                Ok(()) => {
                    if new_name != old {
                        self.nicknames.remove(&old);
                    }
                    let msg = format!("*** you are now known as {}\n", new_name);
                    self.send_to(key, msg.as_bytes());
                }
                Err(reason) => {
                    let msg = format!("nickname rejected: {}\n", reason);
                    self.send_to(key, msg.as_bytes());
                }
            }
            return;
        }

        // Any other slash input is ordinary chat data.
        let nick = self.slots[key].nickname.clone().unwrap_or_default();
        let mut message = Vec::with_capacity(line.len() + nick.len() + 4);
        message.push(b'<');
        message.extend_from_slice(nick.as_bytes());
        message.extend_from_slice(b"> ");
        message.extend_from_slice(&line);
        message.push(b'\n');
        self.broadcast_from(key, &message);
    }

    /// Validate + claim a nickname for `key`. The previous claim, if any,
    /// is left for the caller to release.
    fn admit_nickname(&mut self, key: usize, name: &str) -> std::result::Result<(), &'static str> {
        validate_nickname(name)?;
        match self.nicknames.get(name) {
            Some(&owner) if owner != key => return Err("already in use"),
            _ => {}
        }
        self.nicknames.insert(name.to_string(), key);
        self.slots[key].nickname = Some(name.to_string());
        Ok(())
    }

    /// Queue `bytes` for every live slot except the originator. Full
    /// buffers drop for that slot only, and mark it slow.
    fn broadcast_from(&mut self, from: usize, bytes: &[u8]) {
        let keys: Vec<usize> = self
            .slots
            .iter()
            .map(|(k, _)| k)
            .filter(|&k| k != from)
            .collect();
        for key in keys {
            self.send_to(key, bytes);
        }
    }

    fn send_to(&mut self, key: usize, bytes: &[u8]) {
        let slot = &mut self.slots[key];
        if slot.disconnecting {
            return;
        }
        let pushed = slot.out.push_slice(bytes);
        if pushed < bytes.len() {
            warn!(
                "client #{} not keeping up; dropped {} bytes",
                slot.id,
                bytes.len() - pushed
            );
            if slot.slow_since.is_none() {
                slot.slow_since = Some(Instant::now());
            }
        }
    }

    /// Remove finished and hopelessly slow slots, with part notices.
    fn reap(&mut self, poll: &Poll) {
        let now = Instant::now();
        let doomed: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.disconnecting
                    || slot
                        .slow_since
                        .map(|t| now.duration_since(t) >= SLOW_DISCONNECT)
                        .unwrap_or(false)
            })
            .map(|(k, _)| k)
            .collect();
        for key in doomed {
            let slot = self.slots.remove(key);
            let _ = poll.deregister(&slot.stream);
            debug!(
                "client #{} removed ({:?} since last activity)",
                slot.id,
                slot.last_activity.elapsed()
            );
            if let Some(nick) = &slot.nickname {
                self.nicknames.remove(nick);
                info!("client #{} ({}) left", slot.id, nick);
                if self.chat {
                    let notice = format!("*** {} has left\n", nick);
                    self.broadcast_from(key, notice.as_bytes());
                }
            } else {
                info!("client #{} ({}) left", slot.id, slot.peer);
            }
            // Dropping the slot closes the stream and frees the id.
        }
    }
}

/// Nickname rules: non-empty, at most 32 bytes, no surrounding
/// whitespace, no control characters, none of `[` `]` `*` `/`.
pub fn validate_nickname(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty");
    }
    if name.len() > 32 {
        return Err("longer than 32 characters");
    }
    if name.trim() != name {
        return Err("leading or trailing whitespace");
    }
    if name.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err("control characters");
    }
    if name.contains(|c| matches!(c, '[' | ']' | '*' | '/')) {
        return Err("reserved characters");
    }
    Ok(())
}

fn find_line(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_rules() {
        assert!(validate_nickname("alice").is_ok());
        assert!(validate_nickname("").is_err());
        assert!(validate_nickname(" alice").is_err());
        assert!(validate_nickname("alice ").is_err());
        assert!(validate_nickname("al\tice").is_err());
        assert!(validate_nickname("a[b").is_err());
        assert!(validate_nickname("a]b").is_err());
        assert!(validate_nickname("a*b").is_err());
        assert!(validate_nickname("a/b").is_err());
        assert!(validate_nickname(&"x".repeat(33)).is_err());
        assert!(validate_nickname(&"x".repeat(32)).is_ok());
    }

    #[test]
    fn line_splitting_finds_first_newline() {
        assert_eq!(find_line(b"ab\ncd\n"), Some(2));
        assert_eq!(find_line(b"abcd"), None);
    }
}
