// src/snapshot.rs — MPEG-TS IDR snapshot extractor.
//
// Parses just enough MPEG-TS/PES/NAL structure to find an IDR access unit
// on the program's video PID, accumulates it into a memory-mapped scratch
// file, then hands the whole thing to an out-of-process image encoder via
// `std::process::Command`, using the encoder path/args already carried by
// `config.rs`'s `ffmpeg_path`/`ffmpeg_args`. The encoder runs off the event
// loop; only its stdout fd is registered with the multiplexer, not awaited
// inline.
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const TS_PACKET_LEN: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0;
const SCRATCH_CAPACITY: usize = 8 << 20; // 8 MiB: generous for one GOP prefix.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingPatPmt,
    AwaitingIdr,
    Accumulating,
    Done,
}

struct TsHeader {
    pid: u16,
    payload_unit_start: bool,
    has_payload: bool,
    payload_offset: usize,
}

fn parse_ts_header(pkt: &[u8]) -> Option<TsHeader> {
    if pkt.len() < 4 || pkt[0] != TS_SYNC_BYTE {
        return None;
    }
    let pid = (((pkt[1] & 0x1f) as u16) << 8) | pkt[2] as u16;
    let payload_unit_start = pkt[1] & 0x40 != 0;
    let adaptation_field_control = (pkt[3] >> 4) & 0x3;
    let has_payload = adaptation_field_control == 0b01 || adaptation_field_control == 0b11;
    let mut offset = 4;
    if adaptation_field_control == 0b10 || adaptation_field_control == 0b11 {
        if pkt.len() < 5 {
            return None;
        }
        let adapt_len = pkt[4] as usize;
        offset += 1 + adapt_len;
    }
    if offset > pkt.len() {
        return None;
    }
    Some(TsHeader {
        pid,
        payload_unit_start,
        has_payload,
        payload_offset: offset,
    })
}

/// Reads the first program's PMT PID out of a PAT section payload
/// (`payload_offset` already skips the pointer field the caller handles).
fn parse_pat_pmt_pid(section: &[u8]) -> Option<u16> {
    // section: table_id(1) + section_length fields(2) + ... + program loop.
    if section.len() < 12 {
        return None;
    }
    let section_length = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
    let program_loop_end = (3 + section_length).saturating_sub(4).min(section.len());
    let mut i = 8;
    while i + 4 <= program_loop_end {
        let program_number = u16::from_be_bytes([section[i], section[i + 1]]);
        let pid = (((section[i + 2] & 0x1f) as u16) << 8) | section[i + 3] as u16;
        if program_number != 0 {
            return Some(pid);
        }
        i += 4;
    }
    None
}

const STREAM_TYPE_H264: u8 = 0x1b;
const STREAM_TYPE_HEVC: u8 = 0x24;

/// Reads the video elementary stream PID + its stream type out of a PMT
/// section payload.
fn parse_pmt_video_pid(section: &[u8]) -> Option<(u16, u8)> {
    if section.len() < 12 {
        return None;
    }
    let section_length = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
    let program_info_length = (((section[10] & 0x0f) as usize) << 8) | section[11] as usize;
    let mut i = 12 + program_info_length;
    let end = (3 + section_length).saturating_sub(4).min(section.len());
    while i + 5 <= end {
        let stream_type = section[i];
        let elementary_pid = (((section[i + 1] & 0x1f) as u16) << 8) | section[i + 2] as u16;
        let es_info_length = (((section[i + 3] & 0x0f) as usize) << 8) | section[i + 4] as usize;
        if stream_type == STREAM_TYPE_H264 || stream_type == STREAM_TYPE_HEVC {
            return Some((elementary_pid, stream_type));
        }
        i += 5 + es_info_length;
    }
    None
}

/// Scans a PES payload for an IDR access unit: H.264 NAL type 5, or HEVC
/// NAL types 19/20/21 (IDR_W_RADL, IDR_N_LP, CRA_NUT).
fn contains_idr(payload: &[u8], hevc: bool) -> bool {
    let mut i = 0;
    while i + 3 < payload.len() {
        if payload[i] == 0 && payload[i + 1] == 0 && payload[i + 2] == 1 {
            let nal_start = i + 3;
            if nal_start >= payload.len() {
                break;
            }
            let is_idr = if hevc {
                let nal_type = (payload[nal_start] >> 1) & 0x3f;
                (19..=21).contains(&nal_type)
            } else {
                payload[nal_start] & 0x1f == 5
            };
            if is_idr {
                return true;
            }
            i = nal_start;
        } else {
            i += 1;
        }
    }
    false
}

pub struct SnapshotAccumulator {
    state: State,
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    video_is_hevc: bool,
    scratch_path: PathBuf,
    mmap: MmapMut,
    write_off: usize,
}

impl SnapshotAccumulator {
    pub fn new(scratch_dir: &Path, conn_id: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(scratch_dir)?;
        let scratch_path = scratch_dir.join(format!("snap-{conn_id}.ts"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&scratch_path)?;
        file.set_len(SCRATCH_CAPACITY as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            state: State::AwaitingPatPmt,
            pmt_pid: None,
            video_pid: None,
            video_is_hevc: false,
            scratch_path,
            mmap,
            write_off: 0,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Feeds one 188-byte TS packet. Returns `true` once accumulation is
    /// complete (next PES-start seen after the IDR access unit began).
    pub fn feed(&mut self, pkt: &[u8]) -> bool {
        if self.state == State::Done || pkt.len() != TS_PACKET_LEN {
            return self.state == State::Done;
        }
        let Some(hdr) = parse_ts_header(pkt) else {
            return false;
        };
        if !hdr.has_payload {
            return false;
        }
        let payload = &pkt[hdr.payload_offset..];

        if hdr.pid == PAT_PID && self.pmt_pid.is_none() {
            if let Some(section) = strip_pointer_field(payload, hdr.payload_unit_start) {
                self.pmt_pid = parse_pat_pmt_pid(section);
            }
        } else if Some(hdr.pid) == self.pmt_pid && self.video_pid.is_none() {
            if let Some(section) = strip_pointer_field(payload, hdr.payload_unit_start) {
                if let Some((pid, stream_type)) = parse_pmt_video_pid(section) {
                    self.video_pid = Some(pid);
                    self.video_is_hevc = stream_type == STREAM_TYPE_HEVC;
                    self.state = State::AwaitingIdr;
                }
            }
        }

        if Some(hdr.pid) != self.video_pid {
            return false;
        }

        match self.state {
            State::AwaitingIdr => {
                if hdr.payload_unit_start && contains_idr(payload, self.video_is_hevc) {
                    self.state = State::Accumulating;
                    self.append(pkt);
                }
            }
            State::Accumulating => {
                if hdr.payload_unit_start {
                    self.state = State::Done;
                    return true;
                }
                self.append(pkt);
            }
            _ => {}
        }
        false
    }

    fn append(&mut self, pkt: &[u8]) {
        let end = (self.write_off + pkt.len()).min(self.mmap.len());
        let n = end - self.write_off;
        self.mmap[self.write_off..end].copy_from_slice(&pkt[..n]);
        self.write_off = end;
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    pub fn bytes_accumulated(&self) -> usize {
        self.write_off
    }

    /// Flushes the mmap and spawns the configured encoder over the scratch
    /// file with its stdout piped. Returns the still-running `Child`; the
    /// caller registers its stdout fd with the event loop and drives
    /// completion from readiness rather than waiting on this call.
    pub fn spawn_encoder(&mut self, encoder_path: &str, encoder_args: &[String]) -> anyhow::Result<std::process::Child> {
        self.mmap.flush()?;
        let mut cmd = Command::new(encoder_path);
        cmd.args(encoder_args)
            .arg("-f")
            .arg("mpegts")
            .arg("-i")
            .arg(&self.scratch_path)
            .arg("-frames:v")
            .arg("1")
            .arg("-f")
            .arg("mjpeg")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        Ok(cmd.spawn()?)
    }
}

impl Drop for SnapshotAccumulator {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.scratch_path);
    }
}

fn strip_pointer_field(payload: &[u8], payload_unit_start: bool) -> Option<&[u8]> {
    if !payload_unit_start || payload.is_empty() {
        return None;
    }
    let pointer = payload[0] as usize;
    payload.get(1 + pointer..)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_packet(pid: u16, payload_unit_start: bool, payload: &[u8]) -> [u8; TS_PACKET_LEN] {
        let mut pkt = [0xffu8; TS_PACKET_LEN];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = ((payload_unit_start as u8) << 6) | ((pid >> 8) as u8 & 0x1f);
        pkt[2] = (pid & 0xff) as u8;
        pkt[3] = 0x10; // payload only, no adaptation field, continuity 0
        let n = payload.len().min(TS_PACKET_LEN - 4);
        pkt[4..4 + n].copy_from_slice(&payload[..n]);
        pkt
    }

    #[test]
    fn detects_h264_idr_nal() {
        let mut payload = vec![0u8; 20];
        payload[10..13].copy_from_slice(&[0, 0, 1]);
        payload[13] = 0x65; // nal_ref_idc=3, type=5 (IDR)
        assert!(contains_idr(&payload, false));
    }

    #[test]
    fn non_idr_nal_not_detected() {
        let mut payload = vec![0u8; 20];
        payload[10..13].copy_from_slice(&[0, 0, 1]);
        payload[13] = 0x61; // type=1, non-IDR slice
        assert!(!contains_idr(&payload, false));
    }

    #[test]
    fn strips_pointer_field_on_section_start() {
        let payload = [2u8, 0xaa, 0xaa, 0x11, 0x22];
        let section = strip_pointer_field(&payload, true).unwrap();
        assert_eq!(section, &[0x11, 0x22]);
    }

    #[test]
    fn accumulator_moves_to_awaiting_idr_after_pmt() {
        let dir = std::env::temp_dir().join("iptvgw-snapshot-test");
        let mut acc = SnapshotAccumulator::new(&dir, 42).unwrap();

        // PAT: one program -> PMT pid 0x100.
        let mut pat_section = vec![0u8; 13];
        pat_section[1] = 0x00;
        pat_section[2] = 13 - 3 + 4 - 1; // section_length covering through CRC, loosely
        pat_section[8] = 0x00;
        pat_section[9] = 0x01; // program_number = 1
        pat_section[10] = 0x01;
        pat_section[11] = 0x00; // pmt pid = 0x100
        let mut pat_payload = vec![0u8]; // pointer field
        pat_payload.extend_from_slice(&pat_section);
        let pat_pkt = ts_packet(PAT_PID, true, &pat_payload);
        assert!(!acc.feed(&pat_pkt));
        assert_eq!(acc.pmt_pid, Some(0x100));

        // PMT: one H.264 stream on pid 0x101.
        let mut pmt_section = vec![0u8; 17];
        pmt_section[2] = 18; // section_length: covers through the one stream entry, no CRC in this test vector
        pmt_section[10] = 0x00;
        pmt_section[11] = 0x00; // program_info_length = 0
        pmt_section[12] = STREAM_TYPE_H264;
        pmt_section[13] = 0x01;
        pmt_section[14] = 0x01; // elementary pid 0x101
        pmt_section[15] = 0x00;
        pmt_section[16] = 0x00; // es_info_length = 0
        let mut pmt_payload = vec![0u8];
        pmt_payload.extend_from_slice(&pmt_section);
        let pmt_pkt = ts_packet(0x100, true, &pmt_payload);
        acc.feed(&pmt_pkt);
        assert_eq!(acc.video_pid, Some(0x101));
        assert_eq!(acc.state(), State::AwaitingIdr);
    }
}
