//! Stream-ID translation between client-local and backend-global ID spaces.
//!
//! Every client picks its own stream IDs. The shared backend must never see
//! two clients using the same ID, so each `(client, local_id)` pair is
//! mapped to a unique odd global ID on its first frame. Responses from the
//! backend are mapped back through the owner index.
//!
//! The router does no I/O. The gateway holds it behind a single mutex, which
//! serializes every mutation of the translation tables.

use std::collections::HashMap;

use crate::protocol::{Frame, is_broadcast_id};

/// Identifies one client connection for the lifetime of the gateway.
pub type ClientId = u64;

/// First ID handed out; odd, so it belongs to the client-addressable class.
const FIRST_GLOBAL_ID: u32 = 1;

/// Per-connection translation tables. The two maps are exact inverses.
#[derive(Debug, Default)]
struct ClientStreams {
    local_to_global: HashMap<u32, u32>,
    global_to_local: HashMap<u32, u32>,
}

impl ClientStreams {
    fn insert(&mut self, local_id: u32, global_id: u32) {
        self.local_to_global.insert(local_id, global_id);
        self.global_to_local.insert(global_id, local_id);
    }

    fn remove_global(&mut self, global_id: u32) -> Option<u32> {
        let local_id = self.global_to_local.remove(&global_id)?;
        self.local_to_global.remove(&local_id);
        Some(local_id)
    }
}

/// Where a backend frame should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Rewrite to `local_id` and send to `client`.
    Deliver { client: ClientId, local_id: u32 },
    /// Send the original bytes to every connected client.
    Broadcast,
    /// Deliver to no one.
    Drop(DropReason),
}

/// Why a backend frame was not delivered. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Odd ID with no owner: the owning client went away mid-flight.
    Orphaned,
    /// The owner exists but its mapping was already freed.
    MappingRaced,
}

#[derive(Debug)]
pub struct StreamRouter {
    next_client_id: ClientId,
    next_global_id: u32,
    clients: HashMap<ClientId, ClientStreams>,
    owners: HashMap<u32, ClientId>,
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRouter {
    pub fn new() -> Self {
        Self {
            next_client_id: 1,
            next_global_id: FIRST_GLOBAL_ID,
            clients: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    pub fn register_client(&mut self) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(id, ClientStreams::default());
        id
    }

    /// Rewrite a client frame into the global ID space.
    ///
    /// Allocates a global ID the first time a local ID is seen. A CLOSE or
    /// ERROR frame frees the mapping right away; the frame itself still
    /// carries the global ID so the backend can release its side.
    pub fn route_inbound(&mut self, client: ClientId, mut frame: Frame) -> Frame {
        let global_id = match self
            .clients
            .get(&client)
            .and_then(|streams| streams.local_to_global.get(&frame.stream_id))
        {
            Some(&global_id) => global_id,
            None => {
                let global_id = self.allocate_global_id();
                self.clients
                    .entry(client)
                    .or_default()
                    .insert(frame.stream_id, global_id);
                self.owners.insert(global_id, client);
                tracing::trace!(
                    client,
                    local_id = frame.stream_id,
                    global_id,
                    "mapped stream"
                );
                global_id
            }
        };

        frame.stream_id = global_id;
        if frame.is_terminal() {
            self.release(global_id);
        }
        frame
    }

    /// Decide where a backend frame goes.
    ///
    /// Terminal frames free the mapping once delivery has been decided.
    pub fn route_outbound(&mut self, frame: &Frame) -> Route {
        let global_id = frame.stream_id;
        let Some(&client) = self.owners.get(&global_id) else {
            return if is_broadcast_id(global_id) {
                Route::Broadcast
            } else {
                Route::Drop(DropReason::Orphaned)
            };
        };

        let local_id = self
            .clients
            .get(&client)
            .and_then(|streams| streams.global_to_local.get(&global_id))
            .copied();
        let Some(local_id) = local_id else {
            return Route::Drop(DropReason::MappingRaced);
        };

        if frame.is_terminal() {
            self.release(global_id);
        }
        Route::Deliver { client, local_id }
    }

    /// Forget a client. Returns the global IDs it still owned.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<u32> {
        let Some(streams) = self.clients.remove(&client) else {
            return Vec::new();
        };
        let mut owned: Vec<u32> = streams.global_to_local.into_keys().collect();
        owned.sort_unstable();
        for global_id in &owned {
            self.owners.remove(global_id);
        }
        owned
    }

    pub fn global_id(&self, client: ClientId, local_id: u32) -> Option<u32> {
        self.clients
            .get(&client)?
            .local_to_global
            .get(&local_id)
            .copied()
    }

    pub fn owner(&self, global_id: u32) -> Option<ClientId> {
        self.owners.get(&global_id).copied()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn stream_count(&self) -> usize {
        self.owners.len()
    }

    fn release(&mut self, global_id: u32) {
        if let Some(client) = self.owners.remove(&global_id) {
            if let Some(streams) = self.clients.get_mut(&client) {
                streams.remove_global(global_id);
            }
            tracing::trace!(client, global_id, "released stream");
        }
    }

    /// Next free odd ID. Wraps from `u32::MAX` back to 1 and skips IDs that
    /// are still owned.
    fn allocate_global_id(&mut self) -> u32 {
        loop {
            let id = self.next_global_id;
            self.next_global_id = self.next_global_id.wrapping_add(2);
            if !self.owners.contains_key(&id) {
                return id;
            }
        }
    }
}
