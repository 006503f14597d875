use std::net::SocketAddrV4;

use itertools::Itertools;

use crate::mph::{self, MphError};

/// One registered load generator. The endpoint keeps its slot for the
/// remainder of the iteration once `assign_slots` has run.
#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub endpoint: SocketAddrV4,
    pub slot: usize,
    pub packets_received: u64,
    pub bytes_received: u64,
}

/// The MPH hash key for an endpoint. The same derivation is used when
/// building the hash and on every Running-phase lookup; diverging here would
/// attribute received packets to the wrong slot.
pub fn endpoint_key(endpoint: &SocketAddrV4) -> u32 {
    u32::from(*endpoint.ip()) ^ endpoint.port() as u32
}

/// Server-owned client table with per-slot counters. Owned exclusively by
/// the server's control loop; cleared between iterations in loop mode.
#[derive(Default)]
pub struct Registry {
    clients: Vec<ClientRecord>,
    by_slot: Vec<usize>,
    multiplier: Option<u64>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[ClientRecord] {
        &self.clients
    }

    pub fn multiplier(&self) -> Option<u64> {
        self.multiplier
    }

    /// Record a HELLO sender. Returns true when the endpoint is new; a
    /// duplicate HELLO leaves the table and the registered count untouched.
    pub fn register(&mut self, endpoint: SocketAddrV4) -> bool {
        if self.clients.iter().any(|c| c.endpoint == endpoint) {
            return false;
        }
        self.clients.push(ClientRecord {
            endpoint,
            slot: 0,
            packets_received: 0,
            bytes_received: 0,
        });
        true
    }

    /// Close registration: search the MPH multiplier over all registered
    /// endpoint keys and hand each record its slot. Client identities must
    /// not change after this point.
    pub fn assign_slots(&mut self) -> Result<u64, MphError> {
        let keys: Vec<u32> = self
            .clients
            .iter()
            .map(|c| endpoint_key(&c.endpoint))
            .collect();
        let multiplier = mph::find_multiplier(&keys)?;

        let n = self.clients.len();
        self.by_slot = vec![0; n];
        for (i, c) in self.clients.iter_mut().enumerate() {
            c.slot = mph::slot(multiplier, keys[i], n);
        }
        for (i, c) in self.clients.iter().enumerate() {
            self.by_slot[c.slot] = i;
        }

        self.multiplier = Some(multiplier);
        Ok(multiplier)
    }

    /// The slot an endpoint hashes to under the assigned multiplier. `None`
    /// before `assign_slots`.
    pub fn slot_of(&self, endpoint: &SocketAddrV4) -> Option<usize> {
        let multiplier = self.multiplier?;
        if self.clients.is_empty() {
            return None;
        }
        Some(mph::slot(
            multiplier,
            endpoint_key(endpoint),
            self.clients.len(),
        ))
    }

    /// Count one Running-phase datagram. Unknown or stale senders still hash
    /// into a valid slot; that attribution is an accepted approximation.
    pub fn record_packet(&mut self, sender: SocketAddrV4, len: usize) {
        let Some(multiplier) = self.multiplier else {
            return;
        };
        if self.clients.is_empty() {
            return;
        }
        let slot = mph::slot(multiplier, endpoint_key(&sender), self.clients.len());
        let record = &mut self.clients[self.by_slot[slot]];
        record.packets_received += 1;
        record.bytes_received += len as u64;
    }

    pub fn sorted_by_slot(&self) -> Vec<&ClientRecord> {
        self.clients.iter().sorted_by_key(|c| c.slot).collect()
    }

    /// Drop all per-iteration state ahead of the next Registering phase.
    pub fn clear(&mut self) {
        self.clients.clear();
        self.by_slot.clear();
        self.multiplier = None;
    }
}
