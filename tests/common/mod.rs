//! Shared test infrastructure: a deterministic in-memory transport and a
//! minimal deterministic game.

// not every test binary exercises every helper
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use retrace::checksum::compute_checksum;
use retrace::{
    InputStatus, Message, NonBlockingSocket, SessionConfig, SessionRequest, StateCell,
};

// ================
// In-memory network
// ================

type Mailboxes = Arc<Mutex<HashMap<SocketAddr, VecDeque<(SocketAddr, Message)>>>>;

/// A loss-free, in-order, instant "network" connecting mailbox sockets.
/// Individual sockets can be told to drop their outgoing traffic to
/// simulate loss and outages.
#[derive(Default, Clone)]
pub struct Network {
    mailboxes: Mailboxes,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// A socket bound to `addr`, plus the switch controlling its sends.
    pub fn socket(&self, addr: SocketAddr) -> (MailboxSocket, LossSwitch) {
        self.mailboxes.lock().entry(addr).or_default();
        let switch = LossSwitch(Arc::new(AtomicBool::new(false)));
        (
            MailboxSocket {
                addr,
                mailboxes: Arc::clone(&self.mailboxes),
                dropping: switch.clone(),
            },
            switch,
        )
    }
}

/// Shared toggle: while set, the owning socket drops everything it sends.
#[derive(Clone)]
pub struct LossSwitch(Arc<AtomicBool>);

impl LossSwitch {
    pub fn set_dropping(&self, dropping: bool) {
        self.0.store(dropping, Ordering::SeqCst);
    }

    fn is_dropping(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct MailboxSocket {
    addr: SocketAddr,
    mailboxes: Mailboxes,
    dropping: LossSwitch,
}

impl NonBlockingSocket<SocketAddr> for MailboxSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        if self.dropping.is_dropping() {
            return;
        }
        let mut mailboxes = self.mailboxes.lock();
        if let Some(mailbox) = mailboxes.get_mut(addr) {
            mailbox.push_back((self.addr, msg.clone()));
        }
    }

    fn receive_all(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut mailboxes = self.mailboxes.lock();
        match mailboxes.get_mut(&self.addr) {
            Some(mailbox) => mailbox.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

// =========
// Game stub
// =========

#[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StubInput {
    pub buttons: u8,
}

/// Two tokens walking along a line; each frame every player's token moves
/// by its input value (so diverging inputs diverge the state immediately).
#[derive(Copy, Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct StubState {
    pub frame: i32,
    pub positions: [i64; 2],
}

impl StubState {
    fn advance(&mut self, inputs: &[(StubInput, InputStatus)]) {
        self.frame += 1;
        for (slot, (input, _)) in self.positions.iter_mut().zip(inputs) {
            *slot += i64::from(input.buttons);
        }
    }
}

pub struct StubConfig;

impl SessionConfig for StubConfig {
    type Input = StubInput;
    type State = StubState;
    type Address = SocketAddr;
}

/// Executes session requests against a [`StubState`] and keeps counters
/// the scenario tests assert on.
#[derive(Default)]
pub struct GameStub {
    pub state: StubState,
    pub loads: Vec<i32>,
    pub saves: usize,
}

impl GameStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_requests(&mut self, requests: Vec<SessionRequest<StubConfig>>) {
        for request in requests {
            match request {
                SessionRequest::SaveState { cell, frame } => self.save(&cell, frame.as_i32()),
                SessionRequest::LoadState { cell, frame } => {
                    self.loads.push(frame.as_i32());
                    self.state = cell.load().expect("no state saved for rollback target");
                }
                SessionRequest::AdvanceFrame { inputs, .. } => self.state.advance(&inputs),
            }
        }
    }

    fn save(&mut self, cell: &StateCell<StubState>, frame: i32) {
        assert_eq!(
            self.state.frame, frame,
            "session asked to save a different frame than simulated"
        );
        self.saves += 1;
        let checksum = compute_checksum(&self.state).expect("stub state serializes");
        cell.save(retrace::Frame::new(frame), Some(self.state), Some(checksum));
    }
}

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}
