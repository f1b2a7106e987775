//! In-process datagram network with seeded fault injection (loss, duplication, reordering).
//! Everything is deterministic for a given seed, so reliability tests are reproducible.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transport::Transport;

/// Per-datagram fault probabilities, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
}

impl FaultConfig {
    pub fn lossless() -> Self {
        Self::default()
    }

    pub fn with_loss(mut self, rate: f64) -> Self {
        self.loss_rate = rate;
        self
    }

    pub fn with_duplicates(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    pub fn with_reordering(mut self, rate: f64) -> Self {
        self.reorder_rate = rate;
        self
    }
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    faults: FaultConfig,
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    isolated: HashSet<SocketAddr>,
    dropped: u64,
}

impl SimState {
    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen_bool(rate.clamp(0.0, 1.0))
    }

    fn deliver(&mut self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            self.dropped += 1;
            return;
        }
        if self.roll(self.faults.loss_rate) {
            self.dropped += 1;
            return;
        }
        let copies = if self.roll(self.faults.duplicate_rate) { 2 } else { 1 };
        let reorder = self.roll(self.faults.reorder_rate);
        let Some(len) = self.inboxes.get(&to).map(VecDeque::len) else {
            self.dropped += 1;
            return;
        };
        let at = if reorder { self.rng.gen_range(0..=len) } else { len };
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            for _ in 0..copies {
                inbox.insert(at, (from, datagram.to_vec()));
            }
        }
    }
}

/// Shared handle to a simulated network. Cloning yields another handle to the same network.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    state: Rc<RefCell<SimState>>,
}

impl SimNetwork {
    pub fn new(seed: u64, faults: FaultConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                faults,
                inboxes: HashMap::new(),
                isolated: HashSet::new(),
                dropped: 0,
            })),
        }
    }

    /// Attach a transport at `addr`. Fails with `AddrInUse` if the address is taken.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<SimTransport> {
        let mut state = self.state.borrow_mut();
        if state.inboxes.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        state.inboxes.insert(addr, VecDeque::new());
        Ok(SimTransport {
            addr,
            net: self.clone(),
        })
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        self.state.borrow_mut().faults = faults;
    }

    /// Drop every datagram to or from `addr` until [`SimNetwork::heal`].
    pub fn isolate(&self, addr: SocketAddr) {
        self.state.borrow_mut().isolated.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        self.state.borrow_mut().isolated.remove(&addr);
    }

    /// Datagrams discarded so far (loss, isolation or no receiver).
    pub fn dropped(&self) -> u64 {
        self.state.borrow().dropped
    }

    /// Datagrams queued for `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.state
            .borrow()
            .inboxes
            .get(&addr)
            .map_or(0, VecDeque::len)
    }
}

/// One simulated socket. Dropping it unbinds the address.
#[derive(Debug)]
pub struct SimTransport {
    addr: SocketAddr,
    net: SimNetwork,
}

impl Transport for SimTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.net.state.borrow_mut();
        let Some((from, datagram)) = state
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        // Oversized datagrams are truncated like a real socket would.
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(Some((n, from)))
    }

    fn send_to(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.net.state.borrow_mut().deliver(self.addr, to, datagram);
        Ok(())
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.net.state.borrow_mut().inboxes.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn drain(t: &mut SimTransport) -> Vec<Vec<u8>> {
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while let Some((n, _)) = t.recv_from(&mut buf).unwrap() {
            out.push(buf[..n].to_vec());
        }
        out
    }

    #[test]
    fn lossless_network_is_fifo() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let mut a = net.bind(addr(1)).unwrap();
        let mut b = net.bind(addr(2)).unwrap();
        for i in 0..5u8 {
            a.send_to(&[i], addr(2)).unwrap();
        }
        assert_eq!(net.pending(addr(2)), 5);
        let got = drain(&mut b);
        assert_eq!(got, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[test]
    fn double_bind_fails() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let _a = net.bind(addr(1)).unwrap();
        let err = net.bind(addr(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn full_loss_and_isolation_drop_everything() {
        let net = SimNetwork::new(7, FaultConfig::lossless().with_loss(1.0));
        let mut a = net.bind(addr(1)).unwrap();
        let mut b = net.bind(addr(2)).unwrap();
        a.send_to(b"x", addr(2)).unwrap();
        assert!(drain(&mut b).is_empty());

        net.set_faults(FaultConfig::lossless());
        net.isolate(addr(1));
        a.send_to(b"y", addr(2)).unwrap();
        assert!(drain(&mut b).is_empty());
        assert_eq!(net.dropped(), 2);

        net.heal(addr(1));
        a.send_to(b"z", addr(2)).unwrap();
        assert_eq!(drain(&mut b), vec![b"z".to_vec()]);
    }

    #[test]
    fn duplication_doubles_datagrams() {
        let net = SimNetwork::new(3, FaultConfig::lossless().with_duplicates(1.0));
        let mut a = net.bind(addr(1)).unwrap();
        let mut b = net.bind(addr(2)).unwrap();
        a.send_to(b"d", addr(2)).unwrap();
        assert_eq!(drain(&mut b).len(), 2);
    }

    #[test]
    fn same_seed_same_outcome() {
        let run = |seed| {
            let faults = FaultConfig::lossless()
                .with_loss(0.3)
                .with_reordering(0.5)
                .with_duplicates(0.2);
            let net = SimNetwork::new(seed, faults);
            let mut a = net.bind(addr(1)).unwrap();
            let mut b = net.bind(addr(2)).unwrap();
            for i in 0..50u8 {
                a.send_to(&[i], addr(2)).unwrap();
            }
            drain(&mut b)
        };
        assert_eq!(run(11), run(11));
    }

    #[test]
    fn unbound_destination_drops() {
        let net = SimNetwork::new(1, FaultConfig::lossless());
        let mut a = net.bind(addr(1)).unwrap();
        {
            let _b = net.bind(addr(2)).unwrap();
        }
        a.send_to(b"gone", addr(2)).unwrap();
        assert_eq!(net.dropped(), 1);
    }
}
