//! The contact table kept by chat-style nodes.
//!
//! A contact is created the first time a signed advertisement from a new identity is accepted (or
//! when one is imported explicitly), updated whenever a strictly newer advertisement arrives, and
//! destroyed on explicit removal or when the table is full and the least recently heard-from
//! entry is evicted.
//!
//! Besides the peer's identity and advertised metadata, a contact caches the expensive things:
//! the ECDH shared secret (computed exactly once) and the best known "out-path", a direct route
//! towards the peer learned from a PATH return. The table also tracks the per-sender timestamp
//! high-water marks that defeat replayed datagrams and PATH packets.

use heapless::{String, Vec};

use crate::crypto;
use crate::identity::{Identity, LocalIdentity, SharedSecret};
use crate::mesh::{AckHash, ACK_HASH_SIZE};
use crate::packet::advert::{AdvertData, NodeType};
use crate::packet::MAX_PATH_SIZE;

/// Longest contact name stored (advertised names are truncated to this).
pub const MAX_CONTACT_NAME: usize = 31;

/// Maximum matches returned by a node-hash search.
///
/// Node hashes are a single byte, so several contacts can share one; the mesh disambiguates by
/// MAC trial against each candidate's secret.
pub const MAX_SEARCH_RESULTS: usize = 8;

/// A known peer.
pub struct Contact {
    /// The peer's identity.
    pub id: Identity,
    /// Advertised name.
    pub name: String<MAX_CONTACT_NAME>,
    /// Advertised node type.
    pub node_type: NodeType,
    /// Application-defined flags (favorite markers and the like).
    pub flags: u8,
    /// Direct route towards the peer, next hop first. `None` until a PATH return taught us one.
    pub out_path: Option<Vec<u8, MAX_PATH_SIZE>>,
    /// Timestamp of the newest accepted advertisement, by *their* clock.
    pub last_advert_timestamp: u32,
    /// Cached ECDH secret with this peer.
    pub shared_secret: SharedSecret,
    /// Last modification, by *our* clock.
    pub lastmod: u32,
    /// Advertised location, 1e-6-degree fixed point; zero when unknown.
    pub gps_lat: i32,
    /// See `gps_lat`.
    pub gps_lon: i32,
    /// Room-server sync cursor: fetch messages since this timestamp.
    pub sync_since: u32,
    /// Newest accepted datagram timestamp from this peer (replay high-water mark).
    pub last_msg_timestamp: u32,
    /// Newest accepted PATH timestamp from this peer.
    pub last_path_timestamp: u32,
}

impl Contact {
    fn new(id: Identity, shared_secret: SharedSecret) -> Self {
        Contact {
            id,
            name: String::new(),
            node_type: NodeType::None,
            flags: 0,
            out_path: None,
            last_advert_timestamp: 0,
            shared_secret,
            lastmod: 0,
            gps_lat: 0,
            gps_lon: 0,
            sync_since: 0,
            last_msg_timestamp: 0,
            last_path_timestamp: 0,
        }
    }

    /// Returns whether a direct route to this contact is known.
    pub fn has_out_path(&self) -> bool {
        self.out_path.is_some()
    }
}

/// Outcome of feeding an advertisement into the table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdvertOutcome {
    /// A contact was created.
    NewContact(usize),
    /// An existing contact was refreshed.
    Updated(usize),
    /// Timestamp not newer than the stored one; likely a replay.
    Replayed,
    /// The sender's public key is unusable for key agreement.
    BadKey,
}

/// Bounded table of contacts with advert-driven lifecycle.
pub struct ContactTable<const N: usize> {
    contacts: Vec<Contact, N>,
}

impl<const N: usize> ContactTable<N> {
    pub fn new() -> Self {
        ContactTable {
            contacts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Contact> {
        self.contacts.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Contact> {
        self.contacts.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Applies a verified advertisement: creates or refreshes the sender's contact.
    ///
    /// Advertisements whose timestamp is not strictly greater than the stored one are rejected as
    /// replays. When the table is full, the least recently modified contact is evicted to make
    /// room.
    pub fn apply_advert(
        &mut self,
        self_id: &LocalIdentity,
        id: &Identity,
        timestamp: u32,
        data: &AdvertData<'_>,
        now: u32,
    ) -> AdvertOutcome {
        let existing = self.index_of(id);
        if let Some(idx) = existing {
            if timestamp <= self.contacts[idx].last_advert_timestamp {
                debug!("contact: advert not newer than stored, dropping");
                return AdvertOutcome::Replayed;
            }
        }

        let (idx, is_new) = match existing {
            Some(idx) => (idx, false),
            None => {
                let secret = match self_id.shared_secret(id) {
                    Some(secret) => secret,
                    None => return AdvertOutcome::BadKey,
                };
                if self.contacts.is_full() {
                    self.evict_stalest();
                }
                self.contacts.push(Contact::new(*id, secret)).ok();
                (self.contacts.len() - 1, true)
            }
        };

        let contact = &mut self.contacts[idx];
        contact.name.clear();
        if let Some(name) = data.name {
            let mut n = name.len().min(MAX_CONTACT_NAME);
            while !name.is_char_boundary(n) {
                n -= 1;
            }
            contact.name.push_str(&name[..n]).ok();
        }
        contact.node_type = data.node_type;
        if let Some((lat, lon)) = data.lat_lon {
            contact.gps_lat = lat;
            contact.gps_lon = lon;
        }
        contact.last_advert_timestamp = timestamp;
        contact.lastmod = now;

        if is_new {
            AdvertOutcome::NewContact(idx)
        } else {
            AdvertOutcome::Updated(idx)
        }
    }

    /// Adds a contact by identity alone (import path), computing and caching the shared secret.
    pub fn add_contact(&mut self, self_id: &LocalIdentity, id: &Identity) -> Option<usize> {
        if let Some(idx) = self.index_of(id) {
            return Some(idx);
        }
        let secret = self_id.shared_secret(id)?;
        if self.contacts.is_full() {
            self.evict_stalest();
        }
        self.contacts.push(Contact::new(*id, secret)).ok()?;
        Some(self.contacts.len() - 1)
    }

    /// Removes a contact. Returns whether it existed.
    pub fn remove(&mut self, id: &Identity) -> bool {
        match self.index_of(id) {
            Some(idx) => {
                self.contacts.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Index of the contact with exactly this identity.
    pub fn index_of(&self, id: &Identity) -> Option<usize> {
        self.contacts.iter().position(|c| c.id.matches(id))
    }

    /// Collects the indices of contacts whose node hash matches, for the MAC-trial loop.
    pub fn search_by_hash(&self, hash: &[u8], matches: &mut Vec<usize, MAX_SEARCH_RESULTS>) {
        matches.clear();
        for (idx, contact) in self.contacts.iter().enumerate() {
            if contact.id.is_hash_match(hash) {
                if matches.push(idx).is_err() {
                    break;
                }
            }
        }
    }

    /// Finds a contact by a public-key prefix of any length.
    pub fn find_by_key_prefix(&self, prefix: &[u8]) -> Option<usize> {
        self.contacts
            .iter()
            .position(|c| c.id.pub_key.starts_with(prefix))
    }

    /// Finds the first contact whose name starts with `prefix`.
    pub fn find_by_name_prefix(&self, prefix: &str) -> Option<usize> {
        self.contacts
            .iter()
            .position(|c| c.name.as_str().starts_with(prefix))
    }

    /// Installs a direct route towards a contact, as learned from a PATH return.
    pub fn set_out_path(&mut self, idx: usize, path: &[u8], now: u32) {
        if let Some(contact) = self.contacts.get_mut(idx) {
            let mut out = Vec::new();
            out.extend_from_slice(&path[..path.len().min(MAX_PATH_SIZE)]).ok();
            contact.out_path = Some(out);
            contact.lastmod = now;
        }
    }

    /// Forgets the direct route (eg. after a send timeout); the next send falls back to flood.
    pub fn reset_out_path(&mut self, idx: usize) {
        if let Some(contact) = self.contacts.get_mut(idx) {
            contact.out_path = None;
        }
    }

    /// Replay gate for datagrams: accepts `timestamp` only when strictly greater than the stored
    /// high-water mark, updating it on acceptance.
    pub fn check_msg_timestamp(&mut self, idx: usize, timestamp: u32) -> bool {
        match self.contacts.get_mut(idx) {
            Some(contact) if timestamp > contact.last_msg_timestamp => {
                contact.last_msg_timestamp = timestamp;
                true
            }
            _ => false,
        }
    }

    /// Replay gate for PATH returns, tracked separately from datagrams.
    pub fn check_path_timestamp(&mut self, idx: usize, timestamp: u32) -> bool {
        match self.contacts.get_mut(idx) {
            Some(contact) if timestamp > contact.last_path_timestamp => {
                contact.last_path_timestamp = timestamp;
                true
            }
            _ => false,
        }
    }

    /// Visits up to `last_n` contacts (0 = all), most recently advertised first.
    pub fn visit_recent(&self, last_n: usize, mut visitor: impl FnMut(&Contact)) {
        let mut order: Vec<usize, N> = Vec::new();
        for idx in 0..self.contacts.len() {
            order.push(idx).ok();
        }
        // Insertion sort by advert timestamp, newest first; N is small.
        for i in 1..order.len() {
            let mut j = i;
            while j > 0
                && self.contacts[order[j - 1]].last_advert_timestamp
                    < self.contacts[order[j]].last_advert_timestamp
            {
                order.swap(j - 1, j);
                j -= 1;
            }
        }

        let n = if last_n == 0 {
            order.len()
        } else {
            last_n.min(order.len())
        };
        for &idx in &order[..n] {
            visitor(&self.contacts[idx]);
        }
    }

    fn evict_stalest(&mut self) {
        if let Some(idx) = self
            .contacts
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.lastmod)
            .map(|(idx, _)| idx)
        {
            self.contacts.remove(idx);
        }
    }
}

impl<const N: usize> Default for ContactTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles a text-message body: `timestamp || attempt-flags || text`.
///
/// Returns the body length. The attempt counter keeps retries of the same text from hashing to
/// the same packet (and the same expected ACK).
pub fn make_text_body(dest: &mut [u8], timestamp: u32, attempt: u8, text: &[u8]) -> usize {
    dest[..4].copy_from_slice(&timestamp.to_le_bytes());
    dest[4] = attempt & 3;
    dest[5..5 + text.len()].copy_from_slice(text);
    5 + text.len()
}

/// The acknowledgement tag a receiver computes (and the sender expects) for a text message:
/// SHA-256 over the message body and the *sender's* public key, truncated to 4 bytes.
///
/// The receiver substitutes the sender's stored public key, so a matching tag also proves to the
/// sender who acknowledged.
pub fn expected_ack_hash(timestamp: u32, attempt: u8, text: &[u8], sender: &Identity) -> AckHash {
    let mut body = [0; 5 + crate::packet::MAX_PACKET_PAYLOAD];
    let len = make_text_body(&mut body, timestamp, attempt, text);
    let mut ack = [0; ACK_HASH_SIZE];
    crypto::sha256_pair(&mut ack, &body[..len], &sender.pub_key);
    ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::TestRng;

    fn identities() -> (LocalIdentity, LocalIdentity) {
        (
            LocalIdentity::generate(&mut TestRng(10)),
            LocalIdentity::generate(&mut TestRng(11)),
        )
    }

    fn advert<'a>(name: &'a str) -> AdvertData<'a> {
        AdvertData {
            node_type: NodeType::Chat,
            lat_lon: None,
            feat1: 0,
            feat2: 0,
            name: Some(name),
        }
    }

    #[test]
    fn advert_lifecycle() {
        let (me, peer) = identities();
        let mut table: ContactTable<4> = ContactTable::new();

        let outcome = table.apply_advert(&me, peer.id(), 100, &advert("Bob"), 5000);
        assert_eq!(outcome, AdvertOutcome::NewContact(0));
        assert_eq!(table.get(0).unwrap().name.as_str(), "Bob");
        assert!(!table.get(0).unwrap().has_out_path());

        // Strictly newer timestamp refreshes.
        let outcome = table.apply_advert(&me, peer.id(), 101, &advert("Bobby"), 5001);
        assert_eq!(outcome, AdvertOutcome::Updated(0));
        assert_eq!(table.get(0).unwrap().name.as_str(), "Bobby");
        assert_eq!(table.len(), 1);

        // Equal or older timestamps are replays.
        assert_eq!(
            table.apply_advert(&me, peer.id(), 101, &advert("Mallory"), 5002),
            AdvertOutcome::Replayed
        );
        assert_eq!(
            table.apply_advert(&me, peer.id(), 50, &advert("Mallory"), 5003),
            AdvertOutcome::Replayed
        );
        assert_eq!(table.get(0).unwrap().name.as_str(), "Bobby");
    }

    #[test]
    fn secret_matches_peer_derivation() {
        let (me, peer) = identities();
        let mut table: ContactTable<4> = ContactTable::new();
        table.apply_advert(&me, peer.id(), 1, &advert("Bob"), 0);

        let expected = peer.shared_secret(me.id()).unwrap();
        assert_eq!(table.get(0).unwrap().shared_secret.0, expected.0);
    }

    #[test]
    fn eviction_drops_stalest() {
        let me = LocalIdentity::generate(&mut TestRng(20));
        let mut table: ContactTable<2> = ContactTable::new();

        let p1 = LocalIdentity::generate(&mut TestRng(21));
        let p2 = LocalIdentity::generate(&mut TestRng(22));
        let p3 = LocalIdentity::generate(&mut TestRng(23));

        table.apply_advert(&me, p1.id(), 10, &advert("one"), 1000);
        table.apply_advert(&me, p2.id(), 10, &advert("two"), 2000);
        // Table is full; p1 is the stalest by our clock and gets evicted.
        table.apply_advert(&me, p3.id(), 10, &advert("three"), 3000);

        assert_eq!(table.len(), 2);
        assert!(table.index_of(p1.id()).is_none());
        assert!(table.index_of(p2.id()).is_some());
        assert!(table.index_of(p3.id()).is_some());
    }

    #[test]
    fn hash_search_and_prefix_lookup() {
        let (me, peer) = identities();
        let mut table: ContactTable<4> = ContactTable::new();
        table.apply_advert(&me, peer.id(), 1, &advert("Bob"), 0);

        let mut matches = Vec::new();
        table.search_by_hash(&peer.id().pub_key[..1], &mut matches);
        assert_eq!(&matches[..], &[0]);

        table.search_by_hash(&[peer.id().pub_key[0] ^ 1], &mut matches);
        assert!(matches.is_empty());

        assert_eq!(table.find_by_key_prefix(&peer.id().pub_key[..4]), Some(0));
        assert_eq!(table.find_by_name_prefix("Bo"), Some(0));
        assert_eq!(table.find_by_name_prefix("Al"), None);
    }

    #[test]
    fn out_path_install_and_reset() {
        let (me, peer) = identities();
        let mut table: ContactTable<4> = ContactTable::new();
        table.apply_advert(&me, peer.id(), 1, &advert("Bob"), 0);

        table.set_out_path(0, &[0x11, 0x22], 100);
        let contact = table.get(0).unwrap();
        assert_eq!(contact.out_path.as_ref().unwrap().as_slice(), &[0x11, 0x22]);

        table.reset_out_path(0);
        assert!(!table.get(0).unwrap().has_out_path());
    }

    #[test]
    fn timestamp_gates_are_strict_and_separate() {
        let (me, peer) = identities();
        let mut table: ContactTable<4> = ContactTable::new();
        table.apply_advert(&me, peer.id(), 1, &advert("Bob"), 0);

        assert!(table.check_msg_timestamp(0, 200));
        assert!(!table.check_msg_timestamp(0, 200));
        assert!(!table.check_msg_timestamp(0, 199));
        assert!(table.check_msg_timestamp(0, 201));

        // PATH timestamps are tracked independently.
        assert!(table.check_path_timestamp(0, 150));
        assert!(!table.check_path_timestamp(0, 150));
        assert!(table.check_path_timestamp(0, 201));
    }

    #[test]
    fn recent_visit_order() {
        let me = LocalIdentity::generate(&mut TestRng(30));
        let mut table: ContactTable<4> = ContactTable::new();
        let p1 = LocalIdentity::generate(&mut TestRng(31));
        let p2 = LocalIdentity::generate(&mut TestRng(32));
        let p3 = LocalIdentity::generate(&mut TestRng(33));
        table.apply_advert(&me, p1.id(), 300, &advert("c"), 0);
        table.apply_advert(&me, p2.id(), 100, &advert("a"), 0);
        table.apply_advert(&me, p3.id(), 200, &advert("b"), 0);

        let mut seen: Vec<u32, 4> = Vec::new();
        table.visit_recent(0, |c| {
            seen.push(c.last_advert_timestamp).ok();
        });
        assert_eq!(&seen[..], &[300, 200, 100]);

        seen.clear();
        table.visit_recent(2, |c| {
            seen.push(c.last_advert_timestamp).ok();
        });
        assert_eq!(&seen[..], &[300, 200]);
    }

    #[test]
    fn ack_hash_agrees_between_sender_and_receiver() {
        let (alice, bob) = identities();

        // Bob receives Alice's message and hashes the body together with Alice's key; Alice
        // computed the same thing when she sent it.
        let by_sender = expected_ack_hash(300, 0, b"hi", alice.id());
        let by_receiver = expected_ack_hash(300, 0, b"hi", alice.id());
        assert_eq!(by_sender, by_receiver);

        // Different attempt, text, or identity changes the tag.
        assert_ne!(expected_ack_hash(300, 1, b"hi", alice.id()), by_sender);
        assert_ne!(expected_ack_hash(300, 0, b"ho", alice.id()), by_sender);
        assert_ne!(expected_ack_hash(300, 0, b"hi", bob.id()), by_sender);
    }
}
