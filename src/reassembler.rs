//! Video fragment reassembly and XOR-parity forward error correction
//! (spec §4.4 "Video packet emission", §8 invariant 3 and scenario
//! S5). Grounded on `original_source/.../PacketReassembler.h/.cpp`.
//!
//! Per §9(d) FEC decode is implemented and tested here (the original
//! leaves `TryDecodeFEC` disabled).

use std::collections::BTreeMap;

const FEC_HISTORY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFrame {
    pub payload: Vec<u8>,
    pub timestamp: u32,
    pub keyframe: bool,
    pub rotation: u16,
}

struct PendingFrame {
    timestamp: u32,
    keyframe: bool,
    rotation: u16,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl PendingFrame {
    fn new(timestamp: u32, keyframe: bool, rotation: u16, part_count: usize) -> Self {
        Self { timestamp, keyframe, rotation, parts: vec![None; part_count], received: 0 }
    }

    fn add_fragment(&mut self, index: usize, data: Vec<u8>) {
        if index < self.parts.len() && self.parts[index].is_none() {
            self.parts[index] = Some(data);
            self.received += 1;
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.parts.len()
    }

    fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            if let Some(p) = part {
                out.extend_from_slice(p);
            }
        }
        out
    }
}

struct FecPacket {
    fseq: u8,
    prev_frame_count: u32,
    data: Vec<u8>,
}

/// Reassembles fragmented video frames keyed by an 8-bit wrapping
/// frame sequence number, and opportunistically recovers one missing
/// frame per FEC group via XOR parity.
pub struct PacketReassembler {
    pending: BTreeMap<u8, PendingFrame>,
    /// Completed frame payloads, most recent `FEC_HISTORY` kept, keyed
    /// by frame sequence — used both to build FEC parity on send and
    /// to recover a missing frame on receive.
    history: BTreeMap<u8, Vec<u8>>,
    fec_pending: Vec<FecPacket>,
    last_frame_seq: u8,
}

impl PacketReassembler {
    pub fn new() -> Self {
        Self { pending: BTreeMap::new(), history: BTreeMap::new(), fec_pending: Vec::new(), last_frame_seq: 0 }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.history.clear();
        self.fec_pending.clear();
    }

    /// Adds one fragment of frame `fseq`. Returns the reassembled
    /// frame once every fragment has arrived.
    pub fn add_fragment(
        &mut self,
        fseq: u8,
        fragment_index: u32,
        fragment_count: u32,
        timestamp: u32,
        keyframe: bool,
        rotation: u16,
        payload: Vec<u8>,
    ) -> Option<ReassembledFrame> {
        let entry = self
            .pending
            .entry(fseq)
            .or_insert_with(|| PendingFrame::new(timestamp, keyframe, rotation, fragment_count as usize));
        entry.add_fragment(fragment_index as usize, payload);

        if entry.is_complete() {
            let frame = self.pending.remove(&fseq).unwrap();
            let payload = frame.reassemble();
            self.remember(fseq, payload.clone());
            self.last_frame_seq = fseq;
            return Some(ReassembledFrame { payload, timestamp: frame.timestamp, keyframe: frame.keyframe, rotation: frame.rotation });
        }
        None
    }

    /// Registers a FEC parity packet covering the `prev_frame_count`
    /// frames immediately preceding `fseq`. If exactly one of those
    /// frames is missing from history, recovers and returns it.
    pub fn add_fec(&mut self, fseq: u8, prev_frame_count: u32, data: Vec<u8>) -> Option<ReassembledFrame> {
        let fec = FecPacket { fseq, prev_frame_count, data };
        if let Some(frame) = self.try_decode_fec(&fec) {
            return Some(frame);
        }
        self.fec_pending.push(fec);
        if self.fec_pending.len() > FEC_HISTORY {
            self.fec_pending.remove(0);
        }
        None
    }

    fn covered_seqs(&self, fec: &FecPacket) -> Vec<u8> {
        (1..=fec.prev_frame_count as u16).map(|d| fec.fseq.wrapping_sub(d as u8)).collect()
    }

    fn missing_seq(&self, fec: &FecPacket) -> Option<u8> {
        let covered = self.covered_seqs(fec);
        let missing: Vec<u8> = covered.iter().copied().filter(|s| !self.history.contains_key(s)).collect();
        if missing.len() == 1 {
            Some(missing[0])
        } else {
            None
        }
    }

    /// XOR-parity recovery: `parity = XOR(all covered frames, each
    /// zero-padded to the parity's length)`. If exactly one covered
    /// frame is absent from history, `missing = parity XOR
    /// (XOR of all present frames)`.
    fn try_decode_fec(&mut self, fec: &FecPacket) -> Option<ReassembledFrame> {
        let covered = self.covered_seqs(fec);
        let missing = self.missing_seq(fec)?;

        let mut recovered = fec.data.clone();
        for seq in &covered {
            if *seq == missing {
                continue;
            }
            let present = self.history.get(seq)?;
            xor_into(&mut recovered, present);
        }

        // Trailing zero padding beyond the true payload length cannot
        // be distinguished from content; callers treat the recovered
        // buffer as a best-effort frame and decoders tolerate trailing
        // padding the way they tolerate any other lost information.
        self.remember(missing, recovered.clone());
        Some(ReassembledFrame { payload: recovered, timestamp: 0, keyframe: false, rotation: 0 })
    }

    fn remember(&mut self, fseq: u8, payload: Vec<u8>) {
        self.history.insert(fseq, payload);
        while self.history.len() > FEC_HISTORY {
            if let Some(&oldest) = self.history.keys().next() {
                self.history.remove(&oldest);
            }
        }
    }
}

impl Default for PacketReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes parity for `frames` (used by the sender, spec §4.4): XOR of
/// all frames, each zero-padded to the longest frame's length.
pub fn encode_parity(frames: &[&[u8]]) -> Vec<u8> {
    let max_len = frames.iter().map(|f| f.len()).max().unwrap_or(0);
    let mut parity = vec![0u8; max_len];
    for frame in frames {
        xor_into(&mut parity, frame);
    }
    parity
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (i, b) in src.iter().enumerate() {
        if i < dst.len() {
            dst[i] ^= b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_reassemble_in_any_arrival_order() {
        let mut r = PacketReassembler::new();
        assert!(r.add_fragment(1, 1, 3, 1000, true, 0, b"World".to_vec()).is_none());
        assert!(r.add_fragment(1, 0, 3, 1000, true, 0, b"Hello".to_vec()).is_none());
        let frame = r.add_fragment(1, 2, 3, 1000, true, 0, b"!".to_vec()).unwrap();
        assert_eq!(frame.payload, b"HelloWorld!");
        assert!(frame.keyframe);
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut r = PacketReassembler::new();
        r.add_fragment(2, 0, 2, 0, false, 0, b"AAAA".to_vec());
        r.add_fragment(2, 0, 2, 0, false, 0, b"BBBB".to_vec());
        let frame = r.add_fragment(2, 1, 2, 0, false, 0, b"CCCC".to_vec()).unwrap();
        assert_eq!(frame.payload, b"AAAACCCC");
    }

    #[test]
    fn fec_recovers_one_missing_frame_of_two_covered() {
        let mut r = PacketReassembler::new();
        let frame_10 = b"frame-10-payload".to_vec();
        let frame_11 = b"frame-11-payload".to_vec();

        r.add_fragment(10, 0, 1, 0, false, 0, frame_10.clone());
        // frame 11 is deliberately never delivered — it's the "lost" one.

        // FEC for frame 12 covers the two preceding frames: 11, 10.
        let parity = encode_parity(&[&frame_10, &frame_11]);
        let recovered = r.add_fec(12, 2, parity).expect("frame 11 was the only missing covered frame");
        assert_eq!(recovered.payload, frame_11);
    }

    #[test]
    fn fec_decodes_eagerly_when_missing_frame_is_known_at_arrival() {
        let mut r = PacketReassembler::new();
        let frame_a = b"AAAAAAAAAAAAAAA".to_vec();
        let frame_c = b"CCCCCCCCCCCCCCC".to_vec();
        let missing = b"BBBBBBBBBBBBBBB".to_vec();

        r.add_fragment(1, 0, 1, 0, false, 0, frame_a.clone());
        // frame 2 missing
        r.add_fragment(3, 0, 1, 0, false, 0, frame_c.clone());

        let parity = encode_parity(&[&frame_a, &missing, &frame_c]);
        // FEC packet for frame 4 covering frames 3,2,1 (prev_frame_count=3)
        let recovered = r.add_fec(4, 3, parity).expect("exactly one frame (2) was missing");
        assert_eq!(recovered.payload, missing);
    }
}
