//! The client access-control list kept by repeater- and room-style nodes.
//!
//! Where a chat node keeps contacts it cares about, a server node keeps *clients* that have
//! logged in to it, each with a permission role in the low two bits. The table is bounded;
//! when full, the least recently active non-admin client is evicted.

use heapless::Vec;

use crate::identity::{Identity, LocalIdentity, SharedSecret, PUB_KEY_SIZE};
use crate::packet::MAX_PATH_SIZE;

/// Mask extracting the role from a permission byte.
pub const PERM_ACL_ROLE_MASK: u8 = 3;
/// Unauthenticated / transient client; never persisted.
pub const PERM_ACL_GUEST: u8 = 0;
pub const PERM_ACL_READ_ONLY: u8 = 1;
pub const PERM_ACL_READ_WRITE: u8 = 2;
/// Admins are exempt from LRU eviction.
pub const PERM_ACL_ADMIN: u8 = 3;

/// A client known to this server node.
pub struct ClientInfo {
    /// The client's identity.
    pub id: Identity,
    /// Permission byte; role in the low two bits.
    pub permissions: u8,
    /// Direct route towards the client, next hop first.
    pub out_path: Option<Vec<u8, MAX_PATH_SIZE>>,
    /// Cached ECDH secret with this client.
    pub shared_secret: SharedSecret,
    /// Newest accepted payload timestamp, by *their* clock (replay high-water mark).
    pub last_timestamp: u32,
    /// Newest accepted PATH timestamp, tracked separately from payloads.
    pub last_path_timestamp: u32,
    /// Last activity, by *our* clock; drives LRU eviction.
    pub last_activity: u32,
    /// Room-server cursor: push messages since this timestamp.
    pub sync_since: u32,
}

impl ClientInfo {
    pub fn is_admin(&self) -> bool {
        self.permissions & PERM_ACL_ROLE_MASK == PERM_ACL_ADMIN
    }
}

/// Bounded client table with LRU eviction.
pub struct ClientAcl<const N: usize> {
    clients: Vec<ClientInfo, N>,
}

impl<const N: usize> ClientAcl<N> {
    pub fn new() -> Self {
        ClientAcl {
            clients: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&ClientInfo> {
        self.clients.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ClientInfo> {
        self.clients.get_mut(idx)
    }

    /// Finds a client by a public-key prefix of any length.
    pub fn find(&self, pubkey_prefix: &[u8]) -> Option<usize> {
        self.clients
            .iter()
            .position(|c| c.id.pub_key.starts_with(pubkey_prefix))
    }

    /// Returns the existing client with this identity, or creates one with `init_perms`,
    /// evicting the least recently active non-admin when full.
    ///
    /// `None` when the identity's key is unusable for key agreement, or the table is full of
    /// admins.
    pub fn put(
        &mut self,
        self_id: &LocalIdentity,
        id: &Identity,
        init_perms: u8,
    ) -> Option<usize> {
        if let Some(idx) = self.clients.iter().position(|c| c.id.matches(id)) {
            return Some(idx);
        }

        let secret = self_id.shared_secret(id)?;
        if self.clients.is_full() {
            let evict = self
                .clients
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.is_admin())
                .min_by_key(|(_, c)| c.last_activity)
                .map(|(idx, _)| idx)?;
            self.clients.remove(evict);
        }

        self.clients
            .push(ClientInfo {
                id: *id,
                permissions: init_perms,
                out_path: None,
                shared_secret: secret,
                last_timestamp: 0,
                last_path_timestamp: 0,
                last_activity: 0,
                sync_since: 0,
            })
            .ok()?;
        Some(self.clients.len() - 1)
    }

    /// Collects the indices of clients whose node hash matches, for the MAC-trial loop.
    pub fn search_by_hash(&self, hash: &[u8], matches: &mut Vec<usize, 8>) {
        matches.clear();
        for (idx, client) in self.clients.iter().enumerate() {
            if client.id.is_hash_match(hash) {
                if matches.push(idx).is_err() {
                    break;
                }
            }
        }
    }

    /// Grants or revokes a role, as driven by an admin command.
    ///
    /// Setting the guest role removes the entry (guests are not worth table space). Any other
    /// role requires the complete public key, so a truncated prefix can never grant access to an
    /// unintended identity.
    pub fn apply_permissions(
        &mut self,
        self_id: &LocalIdentity,
        pubkey: &[u8],
        perms: u8,
    ) -> bool {
        if perms & PERM_ACL_ROLE_MASK == PERM_ACL_GUEST {
            match self.find(pubkey) {
                Some(idx) => {
                    self.clients.remove(idx);
                    true
                }
                None => false,
            }
        } else {
            if pubkey.len() < PUB_KEY_SIZE {
                return false;
            }
            let mut key = [0; PUB_KEY_SIZE];
            key.copy_from_slice(&pubkey[..PUB_KEY_SIZE]);
            let id = Identity::new(key);
            match self.put(self_id, &id, 0) {
                Some(idx) => {
                    self.clients[idx].permissions = perms;
                    true
                }
                None => false,
            }
        }
    }

    /// Replay gate: accepts `timestamp` only when strictly greater than the client's stored
    /// high-water mark, recording the activity time on acceptance.
    pub fn check_timestamp(&mut self, idx: usize, timestamp: u32, now: u32) -> bool {
        match self.clients.get_mut(idx) {
            Some(client) if timestamp > client.last_timestamp => {
                client.last_timestamp = timestamp;
                client.last_activity = now;
                true
            }
            _ => false,
        }
    }

    /// Replay gate for PATH returns, tracked separately from payload timestamps.
    pub fn check_path_timestamp(&mut self, idx: usize, timestamp: u32) -> bool {
        match self.clients.get_mut(idx) {
            Some(client) if timestamp > client.last_path_timestamp => {
                client.last_path_timestamp = timestamp;
                true
            }
            _ => false,
        }
    }

    /// Installs a direct route towards a client.
    pub fn set_out_path(&mut self, idx: usize, path: &[u8]) {
        if let Some(client) = self.clients.get_mut(idx) {
            let mut out = Vec::new();
            out.extend_from_slice(&path[..path.len().min(MAX_PATH_SIZE)]).ok();
            client.out_path = Some(out);
        }
    }
}

impl<const N: usize> Default for ClientAcl<N> {
    fn default() -> Self {
        Self::new()
    }
}
