use std::env;

use log::{debug, trace};

use crate::sys;

// Command bytes, RFC 854.
const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

// Negotiated options.
const OPT_ECHO: u8 = 1; // RFC 857
const OPT_SGA: u8 = 3; // RFC 858
const OPT_TTYPE: u8 = 24; // RFC 1091
const OPT_NAWS: u8 = 31; // RFC 1073
const OPT_LINEMODE: u8 = 34; // RFC 1184
const OPT_NEW_ENVIRON: u8 = 39; // RFC 1572

// Subnegotiation verbs shared by TTYPE and NEW-ENVIRON.
const SUB_IS: u8 = 0;
const SUB_SEND: u8 = 1;

// NEW-ENVIRON item codes.
const ENV_VAR: u8 = 0;
const ENV_VALUE: u8 = 1;
const ENV_USERVAR: u8 = 3;

// LINEMODE subnegotiation.
const LM_MODE: u8 = 1;
const LM_SLC: u8 = 3;
const MODE_EDIT: u8 = 0x01;
const MODE_TRAPSIG: u8 = 0x02;
const MODE_ACK: u8 = 0x04;
const SLC_VALUE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Data,
    Iac,
    Will,
    Wont,
    Do,
    Dont,
    Sb,
    SbIac,
}

#[derive(Clone, Copy, Default)]
struct OptionRecord {
    /// Remote is performing the option (we answered its WILL with DO).
    remote_will: bool,
    /// We are performing the option (we answered DO with WILL).
    local_will: bool,
    /// Our own DO/WILL is in flight; the next matching answer is an ack,
    /// not a fresh offer. This is what keeps negotiation loop-free.
    pending_remote: bool,
    pending_local: bool,
    /// We already refused an identical offer once; stay silent after that.
    refused_remote: bool,
    refused_local: bool,
}

/// Telnet byte-level filter between the pump and the remote stream.
///
/// `feed` decodes inbound bytes into caller-owned buffers: application
/// data into one, negotiation replies (to be written back to the remote)
/// into the other. Nothing is allocated on behalf of the caller beyond
/// those buffers.
pub struct Telnet {
    state: ParseState,
    options: Vec<OptionRecord>,
    sb_option: Option<u8>,
    sb_buf: Vec<u8>,
    echo_guard: Option<sys::TermiosGuard>,
    naws_active: bool,
}

impl Telnet {
    pub fn new() -> Telnet {
        Telnet {
            state: ParseState::Data,
            options: vec![OptionRecord::default(); 256],
            sb_option: None,
            sb_buf: Vec::new(),
            echo_guard: None,
            naws_active: false,
        }
    }

    /// Open the session by proactively asking both sides to suppress
    /// go-ahead. The pending flags mark the offers as ours, so the
    /// eventual WILL/WONT/DO/DONT answers read as acks rather than fresh
    /// offers and the exchange cannot loop.
    pub fn start(&mut self, replies: &mut Vec<u8>) {
        let rec = &mut self.options[OPT_SGA as usize];
        if !rec.remote_will && !rec.pending_remote {
            rec.pending_remote = true;
            replies.extend_from_slice(&[IAC, DO, OPT_SGA]);
        }
        if !rec.local_will && !rec.pending_local {
            rec.pending_local = true;
            replies.extend_from_slice(&[IAC, WILL, OPT_SGA]);
        }
    }

    /// Escape application data for the wire: a literal 0xFF doubles.
    pub fn escape(input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if b == IAC {
                out.push(IAC);
            }
            out.push(b);
        }
    }

    /// Decode `input`. Inline data lands in `data` (order preserved),
    /// protocol responses in `replies`.
    pub fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            match self.state {
                ParseState::Data => {
                    if b == IAC {
                        self.state = ParseState::Iac;
                    } else {
                        data.push(b);
                    }
                }
                ParseState::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        self.state = ParseState::Data;
                    }
                    WILL => self.state = ParseState::Will,
                    WONT => self.state = ParseState::Wont,
                    DO => self.state = ParseState::Do,
                    DONT => self.state = ParseState::Dont,
                    SB => {
                        self.sb_option = None;
                        self.sb_buf.clear();
                        self.state = ParseState::Sb;
                    }
                    // NOP, DM, BRK, IP, AO, AYT, EC, EL, GA, EOR: two-byte
                    // commands are consumed without reaching the pump.
                    other => {
                        trace!("telnet: consumed command {}", other);
                        self.state = ParseState::Data;
                    }
                },
                ParseState::Will => {
                    self.handle_will(b, replies);
                    self.state = ParseState::Data;
                }
                ParseState::Wont => {
                    self.handle_wont(b, replies);
                    self.state = ParseState::Data;
                }
                ParseState::Do => {
                    self.handle_do(b, replies);
                    self.state = ParseState::Data;
                }
                ParseState::Dont => {
                    self.handle_dont(b, replies);
                    self.state = ParseState::Data;
                }
                ParseState::Sb => {
                    if self.sb_option.is_none() {
                        self.sb_option = Some(b);
                    } else if b == IAC {
                        self.state = ParseState::SbIac;
                    } else {
                        self.sb_buf.push(b);
                    }
                }
                ParseState::SbIac => {
                    if b == IAC {
                        // Inner IAC IAC is a literal 0xFF in the body.
                        self.sb_buf.push(IAC);
                        self.state = ParseState::Sb;
                    } else if b == SE {
                        let option = self.sb_option.take().unwrap_or(0);
                        let body = std::mem::take(&mut self.sb_buf);
                        self.subnegotiate(option, &body, replies);
                        self.state = ParseState::Data;
                    } else {
                        debug!("telnet: malformed subnegotiation terminator {}", b);
                        self.state = ParseState::Data;
                    }
                }
            }
        }
    }

    /// Re-announce the window size after a SIGWINCH, if NAWS is active.
    pub fn window_changed(&mut self, replies: &mut Vec<u8>) {
        if self.naws_active {
            self.send_naws(replies);
        }
    }

    fn accepts_remote(option: u8) -> bool {
        option == OPT_ECHO || option == OPT_SGA
    }

    fn offers_local(option: u8) -> bool {
        matches!(
            option,
            OPT_SGA | OPT_TTYPE | OPT_NAWS | OPT_LINEMODE | OPT_NEW_ENVIRON
        )
    }

    fn handle_will(&mut self, option: u8, replies: &mut Vec<u8>) {
        let rec = &mut self.options[option as usize];
        if rec.pending_remote {
            rec.pending_remote = false;
            rec.remote_will = true;
        } else if rec.remote_will {
            // Duplicate announcement; answering again would loop.
        } else if Telnet::accepts_remote(option) {
            rec.remote_will = true;
            replies.extend_from_slice(&[IAC, DO, option]);
        } else if !rec.refused_remote {
            rec.refused_remote = true;
            replies.extend_from_slice(&[IAC, DONT, option]);
        }
        if option == OPT_ECHO && self.options[option as usize].remote_will {
            self.suppress_local_echo();
        }
    }

    fn handle_wont(&mut self, option: u8, replies: &mut Vec<u8>) {
        let rec = &mut self.options[option as usize];
        if rec.pending_remote {
            rec.pending_remote = false;
        } else if rec.remote_will {
            rec.remote_will = false;
            replies.extend_from_slice(&[IAC, DONT, option]);
        }
        if option == OPT_ECHO {
            self.echo_guard = None;
        }
    }

    fn handle_do(&mut self, option: u8, replies: &mut Vec<u8>) {
        let rec = &mut self.options[option as usize];
        let mut newly_active = false;
        if rec.pending_local {
            rec.pending_local = false;
            rec.local_will = true;
            newly_active = true;
        } else if rec.local_will {
            // Duplicate request; stay silent.
        } else if Telnet::offers_local(option) {
            rec.local_will = true;
            newly_active = true;
            replies.extend_from_slice(&[IAC, WILL, option]);
        } else if !rec.refused_local {
            rec.refused_local = true;
            replies.extend_from_slice(&[IAC, WONT, option]);
        }
        if newly_active {
            match option {
                OPT_NAWS => {
                    self.naws_active = true;
                    self.send_naws(replies);
                }
                OPT_LINEMODE => self.send_linemode_mode(replies),
                _ => {}
            }
        }
    }

    fn handle_dont(&mut self, option: u8, replies: &mut Vec<u8>) {
        let rec = &mut self.options[option as usize];
        if rec.pending_local {
            rec.pending_local = false;
        } else if rec.local_will {
            rec.local_will = false;
            replies.extend_from_slice(&[IAC, WONT, option]);
        }
        if option == OPT_NAWS {
            self.naws_active = false;
        }
    }

    fn subnegotiate(&mut self, option: u8, body: &[u8], replies: &mut Vec<u8>) {
        match option {
            OPT_TTYPE if body.first() == Some(&SUB_SEND) => {
                let term = env::var("TERM").unwrap_or_else(|_| "unknown".into());
                let mut payload = vec![SUB_IS];
                Telnet::escape(term.as_bytes(), &mut payload);
                send_sub(replies, OPT_TTYPE, &payload);
            }
            OPT_NEW_ENVIRON if body.first() == Some(&SUB_SEND) => {
                let mut payload = vec![SUB_IS];
                for name in parse_env_request(&body[1..]) {
                    if let Ok(value) = env::var(&name) {
                        payload.push(ENV_VAR);
                        Telnet::escape(name.as_bytes(), &mut payload);
                        payload.push(ENV_VALUE);
                        Telnet::escape(value.as_bytes(), &mut payload);
                    }
                }
                send_sub(replies, OPT_NEW_ENVIRON, &payload);
            }
            OPT_LINEMODE => match body.first() {
                Some(&LM_SLC) => {
                    let mut payload = vec![LM_SLC];
                    for (func, value) in sys::slc_table() {
                        payload.push(func);
                        payload.push(SLC_VALUE);
                        if value == IAC {
                            payload.push(IAC);
                        }
                        payload.push(value);
                    }
                    send_sub(replies, OPT_LINEMODE, &payload);
                }
                Some(&LM_MODE) => {
                    if let Some(&mask) = body.get(1) {
                        if mask & MODE_ACK == 0 {
                            send_sub(replies, OPT_LINEMODE, &[LM_MODE, mask | MODE_ACK]);
                        }
                    }
                }
                _ => {}
            },
            _ => trace!("telnet: ignored subnegotiation for option {}", option),
        }
    }

    fn send_naws(&mut self, replies: &mut Vec<u8>) {
        let (cols, rows) = sys::winsize().unwrap_or((80, 24));
        let mut payload = Vec::with_capacity(8);
        for &half in &[cols, rows] {
            for &byte in &half.to_be_bytes() {
                if byte == IAC {
                    payload.push(IAC);
                }
                payload.push(byte);
            }
        }
        send_sub(replies, OPT_NAWS, &payload);
    }

    fn send_linemode_mode(&mut self, replies: &mut Vec<u8>) {
        send_sub(replies, OPT_LINEMODE, &[LM_MODE, MODE_EDIT | MODE_TRAPSIG]);
    }

    fn suppress_local_echo(&mut self) {
        if self.echo_guard.is_some() {
            return;
        }
        match sys::TermiosGuard::echo_off(0) {
            Ok(guard) => self.echo_guard = Some(guard),
            Err(e) => debug!("telnet: cannot disable local echo: {}", e),
        }
    }
}

fn send_sub(replies: &mut Vec<u8>, option: u8, payload: &[u8]) {
    replies.extend_from_slice(&[IAC, SB, option]);
    replies.extend_from_slice(payload);
    replies.extend_from_slice(&[IAC, SE]);
}

// A NEW-ENVIRON SEND body is a sequence of VAR/USERVAR markers, each
// followed by a name; bare SEND asks for everything, which we answer with
// an empty IS.
fn parse_env_request(body: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    for &b in body {
        if b == ENV_VAR || b == ENV_USERVAR {
            if let Some(name) = current.take() {
                if !name.is_empty() {
                    names.push(String::from_utf8_lossy(&name).into_owned());
                }
            }
            current = Some(Vec::new());
        } else if let Some(name) = &mut current {
            name.push(b);
        }
    }
    if let Some(name) = current {
        if !name.is_empty() {
            names.push(String::from_utf8_lossy(&name).into_owned());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(t: &mut Telnet, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::new();
        let mut replies = Vec::new();
        t.feed(input, &mut data, &mut replies);
        (data, replies)
    }

    #[test]
    fn escape_then_parse_is_identity() {
        let mut t = Telnet::new();
        let original: Vec<u8> = (0u8..=255).cycle().take(600).collect();
        let mut wire = Vec::new();
        Telnet::escape(&original, &mut wire);
        let (data, replies) = feed_all(&mut t, &wire);
        assert_eq!(data, original);
        assert!(replies.is_empty());
    }

    #[test]
    fn doubled_iac_decodes_to_literal() {
        let mut t = Telnet::new();
        let (data, _) = feed_all(&mut t, &[b'T', b'e', b's', b't', IAC, IAC, b'D']);
        assert_eq!(data, b"Test\xffD");
    }

    #[test]
    fn two_byte_commands_are_elided() {
        let mut t = Telnet::new();
        let (data, replies) = feed_all(&mut t, &[b'a', IAC, 241, b'b', IAC, 242, b'c']);
        assert_eq!(data, b"abc");
        assert!(replies.is_empty());
    }

    #[test]
    fn session_start_offers_suppress_go_ahead() {
        let mut t = Telnet::new();
        let mut replies = Vec::new();
        t.start(&mut replies);
        assert_eq!(replies, vec![IAC, DO, OPT_SGA, IAC, WILL, OPT_SGA]);

        // Starting again while the offers are in flight stays silent.
        let mut again = Vec::new();
        t.start(&mut again);
        assert!(again.is_empty());

        // The peer's answers are acks, not fresh offers: no response,
        // and the option ends up active both ways.
        let (_, replies) = feed_all(&mut t, &[IAC, WILL, OPT_SGA, IAC, DO, OPT_SGA]);
        assert!(replies.is_empty());
    }

    #[test]
    fn refused_offer_gets_no_answer() {
        let mut t = Telnet::new();
        let mut replies = Vec::new();
        t.start(&mut replies);
        // Negative acks to our own offers must not be answered; replying
        // to a response is how negotiation loops start.
        let (_, replies) = feed_all(&mut t, &[IAC, WONT, OPT_SGA, IAC, DONT, OPT_SGA]);
        assert!(replies.is_empty());
    }

    #[test]
    fn will_echo_is_accepted_exactly_once() {
        let mut t = Telnet::new();
        let (_, replies) = feed_all(&mut t, &[IAC, WILL, OPT_ECHO]);
        assert_eq!(replies, vec![IAC, DO, OPT_ECHO]);
        // The duplicate offer must not provoke a second answer.
        let (_, replies) = feed_all(&mut t, &[IAC, WILL, OPT_ECHO]);
        assert!(replies.is_empty());
    }

    #[test]
    fn unknown_option_refused_once() {
        let mut t = Telnet::new();
        let (_, replies) = feed_all(&mut t, &[IAC, WILL, 99]);
        assert_eq!(replies, vec![IAC, DONT, 99]);
        let (_, replies) = feed_all(&mut t, &[IAC, WILL, 99]);
        assert!(replies.is_empty());

        let (_, replies) = feed_all(&mut t, &[IAC, DO, 99]);
        assert_eq!(replies, vec![IAC, WONT, 99]);
        let (_, replies) = feed_all(&mut t, &[IAC, DO, 99]);
        assert!(replies.is_empty());
    }

    #[test]
    fn do_naws_answers_will_plus_subnegotiation() {
        let mut t = Telnet::new();
        let (_, replies) = feed_all(&mut t, &[IAC, DO, OPT_NAWS]);
        assert_eq!(&replies[..3], &[IAC, WILL, OPT_NAWS]);
        assert_eq!(&replies[3..6], &[IAC, SB, OPT_NAWS]);
        assert_eq!(&replies[replies.len() - 2..], &[IAC, SE]);
        // Window change while active re-announces.
        let mut again = Vec::new();
        t.window_changed(&mut again);
        assert_eq!(&again[..3], &[IAC, SB, OPT_NAWS]);
    }

    #[test]
    fn ttype_send_reports_term() {
        env::set_var("TERM", "vt100");
        let mut t = Telnet::new();
        let (_, replies) = feed_all(
            &mut t,
            &[IAC, DO, OPT_TTYPE, IAC, SB, OPT_TTYPE, SUB_SEND, IAC, SE],
        );
        assert_eq!(&replies[..3], &[IAC, WILL, OPT_TTYPE]);
        let sub = &replies[3..];
        assert_eq!(&sub[..4], &[IAC, SB, OPT_TTYPE, SUB_IS]);
        assert_eq!(&sub[4..4 + 5], b"vt100");
    }

    #[test]
    fn new_environ_send_returns_requested_vars() {
        env::set_var("NCRS_TEST_ENV", "yes");
        let mut t = Telnet::new();
        let mut request = vec![IAC, SB, OPT_NEW_ENVIRON, SUB_SEND, ENV_VAR];
        request.extend_from_slice(b"NCRS_TEST_ENV");
        request.extend_from_slice(&[IAC, SE]);
        let (_, replies) = feed_all(&mut t, &request);
        let expected_prefix = [IAC, SB, OPT_NEW_ENVIRON, SUB_IS, ENV_VAR];
        assert_eq!(&replies[..5], &expected_prefix);
        let body = &replies[5..replies.len() - 2];
        assert!(body.starts_with(b"NCRS_TEST_ENV"));
        assert!(body.ends_with(b"yes"));
    }

    #[test]
    fn subnegotiation_body_survives_inner_iac() {
        let mut t = Telnet::new();
        // Unknown subnegotiation: body is buffered (including the literal
        // 0xFF) and dropped without corrupting the data stream.
        let (data, replies) = feed_all(
            &mut t,
            &[IAC, SB, 200, 1, IAC, IAC, 2, IAC, SE, b'o', b'k'],
        );
        assert_eq!(data, b"ok");
        assert!(replies.is_empty());
    }

    #[test]
    fn linemode_negotiation_declares_edit_and_trapsig() {
        let mut t = Telnet::new();
        let (_, replies) = feed_all(&mut t, &[IAC, DO, OPT_LINEMODE]);
        assert_eq!(&replies[..3], &[IAC, WILL, OPT_LINEMODE]);
        assert_eq!(
            &replies[3..],
            &[IAC, SB, OPT_LINEMODE, LM_MODE, MODE_EDIT | MODE_TRAPSIG, IAC, SE]
        );
    }
}
