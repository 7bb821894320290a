//! Packet metadata over a pool-leased buffer.
//!
//! A [`Packet`] owns one [`PoolBuf`] plus the metadata the forwarding
//! plane needs: the receiving interface and the data window (offset and
//! length) inside the buffer. Headroom before the window leaves space for
//! encapsulation headers without copying.

use arrayvec::ArrayVec;

use crate::config::{MAX_BURST_SZ, PKT_HEADROOM};
use crate::mempool::PoolBuf;

/// Index of a virtual interface (vif).
pub type VifIndex = u16;

/// A bounded batch of packets processed together.
pub type PacketBurst = ArrayVec<Packet, MAX_BURST_SZ>;

/// A single packet: metadata plus a leased buffer.
pub struct Packet {
    buf: PoolBuf,
    vif: VifIndex,
    data_off: usize,
    data_len: usize,
}

impl Packet {
    /// Wrap a pool buffer as an empty packet received on `vif`,
    /// with the data window starting after the default headroom.
    pub fn from_buf(buf: PoolBuf, vif: VifIndex) -> Self {
        let data_off = PKT_HEADROOM.min(buf.len());
        Self {
            buf,
            vif,
            data_off,
            data_len: 0,
        }
    }

    /// Receiving interface.
    #[inline]
    pub fn vif(&self) -> VifIndex {
        self.vif
    }

    /// Rebind the packet to another interface.
    #[inline]
    pub fn set_vif(&mut self, vif: VifIndex) {
        self.vif = vif;
    }

    /// Packet payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_off..self.data_off + self.data_len]
    }

    /// Mutable packet payload.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_off..self.data_off + self.data_len]
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data_len
    }

    /// Whether the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Bytes available before the data window.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// Bytes available after the data window.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.data_off - self.data_len
    }

    /// Extend the window at the tail by `n` bytes and return the new
    /// region, or `None` if the tailroom is too small.
    pub fn append(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.tailroom() {
            return None;
        }
        let start = self.data_off + self.data_len;
        self.data_len += n;
        Some(&mut self.buf[start..start + n])
    }

    /// Extend the window at the head by `n` bytes and return the new
    /// region, or `None` if the headroom is too small.
    pub fn prepend(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.data_off {
            return None;
        }
        self.data_off -= n;
        self.data_len += n;
        Some(&mut self.buf[self.data_off..self.data_off + n])
    }

    /// Copy `bytes` into the packet, replacing the current payload.
    /// Returns `false` if the buffer cannot hold them.
    pub fn set_data(&mut self, bytes: &[u8]) -> bool {
        if self.data_off + bytes.len() > self.buf.len() {
            return false;
        }
        self.data_len = bytes.len();
        self.data_mut().copy_from_slice(bytes);
        true
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("vif", &self.vif)
            .field("len", &self.data_len)
            .field("headroom", &self.headroom())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_PACKET_SZ;
    use crate::mempool::Mempool;

    fn make_packet() -> Packet {
        let pool = Mempool::new("pkt-test", 4, MAX_PACKET_SZ);
        Packet::from_buf(pool.try_alloc().unwrap(), 7)
    }

    #[test]
    fn test_rooms() {
        let mut pkt = make_packet();
        assert_eq!(pkt.vif(), 7);
        assert_eq!(pkt.len(), 0);
        assert_eq!(pkt.headroom(), PKT_HEADROOM);

        assert!(pkt.set_data(b"hello"));
        assert_eq!(pkt.data(), b"hello");
        assert_eq!(pkt.tailroom(), MAX_PACKET_SZ - PKT_HEADROOM - 5);
    }

    #[test]
    fn test_prepend_append() {
        let mut pkt = make_packet();
        assert!(pkt.set_data(b"payload"));

        pkt.prepend(4).unwrap().copy_from_slice(b"hdr:");
        assert_eq!(pkt.data(), b"hdr:payload");

        pkt.append(2).unwrap().copy_from_slice(b"!!");
        assert_eq!(pkt.data(), b"hdr:payload!!");

        // Headroom is finite.
        assert!(pkt.prepend(PKT_HEADROOM).is_none());
    }
}
