//! Packet identifier allocation and tracking.
//!
//! Implements requirements from MQTT spec:
//! - [MQTT-2.2.1-3] Each time a Client sends a new SUBSCRIBE, UNSUBSCRIBE, or PUBLISH (QoS > 0)
//!   it MUST assign a non-zero Packet Identifier that is currently unused.
//! - [MQTT-4.3.3-1] An identifier becomes available for reuse once the exchange completes.

const WORDS: usize = 65536 / 64;

/// Hands out 16-bit non-zero identifiers for QoS 1/2 PUBLISH, SUBSCRIBE and
/// UNSUBSCRIBE.
///
/// Next-fit: the first free identifier at or after the cursor is returned and
/// the cursor moves past it, wrapping from 65535 to 1. Identifiers therefore
/// come back in increasing order until the space wraps, which keeps a freshly
/// released id away from the next allocation for as long as possible.
#[derive(Debug)]
pub struct PacketIdAllocator {
    cursor: u16,
    /// One bit per identifier; bit 0 (identifier 0) is never set.
    bits: Box<[u64; WORDS]>,
    in_use: usize,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            cursor: 1,
            bits: Box::new([0; WORDS]),
            in_use: 0,
        }
    }

    /// Allocate an unused identifier, or `None` when all 65535 are in use.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.in_use == u16::MAX as usize {
            return None;
        }
        let mut id = self.cursor;
        while self.is_in_use(id) {
            id = next(id);
        }
        self.set(id);
        self.cursor = next(id);
        Some(id)
    }

    /// Release an identifier after its exchange completes.
    ///
    /// Call this when:
    /// - QoS 1: PUBACK received
    /// - QoS 2: PUBCOMP (or a failed PUBREC) received
    /// - SUBSCRIBE: SUBACK received
    /// - UNSUBSCRIBE: UNSUBACK received
    pub fn release(&mut self, id: u16) {
        if id != 0 && self.is_in_use(id) {
            let (word, mask) = slot(id);
            self.bits[word] &= !mask;
            self.in_use -= 1;
        }
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        let (word, mask) = slot(id);
        self.bits[word] & mask != 0
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    /// Forget every allocation and restart at 1 (fresh session).
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.in_use = 0;
        self.cursor = 1;
    }

    fn set(&mut self, id: u16) {
        let (word, mask) = slot(id);
        self.bits[word] |= mask;
        self.in_use += 1;
    }
}

fn slot(id: u16) -> (usize, u64) {
    (id as usize / 64, 1u64 << (id % 64))
}

/// Successor of `id`, skipping 0.
fn next(id: u16) -> u16 {
    match id.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}
