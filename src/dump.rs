//! Packet dump and offline replay
//!
//! A [`PacketTap`] copies every packet this side encodes (local) and every
//! packet it receives (remote) into a dump file, written by a background
//! thread. [`Replay`] decodes a dump afterwards into raw PCM and gnuplot
//! tables of packet sizes, one set per direction.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::codec::{FrameDecoder, OpusDecoder};
use crate::error::{CodecError, DumpError, Result};
use crate::protocol::{HeaderFormat, PacketHeader};

/// Records queued for the writer thread before new ones are dropped
const DUMP_CHANNEL_CAPACITY: usize = 1024;

/// How often the writer thread checks for `finish`
const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Which side produced a dumped packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Encoded here, about to be sent
    Local,
    /// Received from the peer, before decode
    Remote,
}

impl Direction {
    fn file_prefix(self) -> &'static str {
        match self {
            Direction::Local => "local",
            Direction::Remote => "remote",
        }
    }
}

/// One packet in a dump file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpRecord {
    pub direction: Direction,
    pub stamp: DateTime<Utc>,
    /// Datagram bytes, header included
    pub packet: Vec<u8>,
}

/// Cheap cloneable handle feeding a [`DumpWriter`].
///
/// Recording never blocks: when the writer falls behind, records are dropped
/// and counted.
#[derive(Clone)]
pub struct PacketTap {
    records: Sender<DumpRecord>,
    dropped: Arc<AtomicU64>,
}

impl PacketTap {
    pub fn record(&self, direction: Direction, packet: &[u8]) {
        let record = DumpRecord {
            direction,
            stamp: Utc::now(),
            packet: packet.to_vec(),
        };
        if self.records.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records lost because the writer was full or gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Background thread appending records to a dump file
pub struct DumpWriter {
    tap: PacketTap,
    stop: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<Result<u64>>>,
    path: PathBuf,
}

impl DumpWriter {
    /// Create (or truncate) `path` and start the writer thread
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let (records_tx, records_rx) = bounded::<DumpRecord>(DUMP_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let thread_handle = thread::Builder::new()
            .name("packet-dump".to_string())
            .spawn(move || write_loop(BufWriter::new(file), records_rx, thread_stop))?;

        info!("Dumping packets to {}", path.display());

        Ok(Self {
            tap: PacketTap {
                records: records_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            stop,
            thread_handle: Some(thread_handle),
            path: path.to_path_buf(),
        })
    }

    pub fn tap(&self) -> PacketTap {
        self.tap.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write out everything recorded so far and stop. Returns the record count.
    pub fn finish(mut self) -> Result<u64> {
        self.stop_thread()
    }

    fn stop_thread(&mut self) -> Result<u64> {
        self.stop.store(true, Ordering::SeqCst);
        match self.thread_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| DumpError::WriterPanicked)?,
            None => Ok(0),
        }
    }
}

impl Drop for DumpWriter {
    fn drop(&mut self) {
        if let Err(e) = self.stop_thread() {
            warn!("Packet dump incomplete: {}", e);
        }
    }
}

fn write_loop(mut out: BufWriter<File>, records: Receiver<DumpRecord>, stop: Arc<AtomicBool>) -> Result<u64> {
    let mut written = 0u64;

    loop {
        match records.recv_timeout(WRITER_POLL_INTERVAL) {
            Ok(record) => {
                write_record(&mut out, &record)?;
                written += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Whatever was queued before the stop request
    while let Ok(record) = records.try_recv() {
        write_record(&mut out, &record)?;
        written += 1;
    }

    out.flush()?;
    debug!("Packet dump closed after {} records", written);
    Ok(written)
}

fn write_record(out: &mut impl Write, record: &DumpRecord) -> Result<()> {
    bincode::serialize_into(out, record)
        .map_err(|e| DumpError::Encode(e.to_string()).into())
}

/// Iterator over the records of a dump file
pub struct DumpReader<R: Read> {
    input: R,
    done: bool,
}

/// Open a dump file for reading
pub fn read_dump(path: &Path) -> Result<DumpReader<BufReader<File>>> {
    Ok(DumpReader::new(BufReader::new(File::open(path)?)))
}

impl<R: Read> DumpReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, done: false }
    }
}

impl<R: Read> Iterator for DumpReader<R> {
    type Item = Result<DumpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match bincode::deserialize_from(&mut self.input) {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.done = true;
                match *e {
                    bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => None,
                    _ => Some(Err(DumpError::Corrupt(e.to_string()).into())),
                }
            }
        }
    }
}

/// Gnuplot table of packet sizes
struct PlotFile {
    out: BufWriter<File>,
}

impl PlotFile {
    fn create(path: &Path) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "# gnuplot data for packet dump tracing\r\n")?;
        write!(out, "# seq\tpacket_size\tdecoded size\r\n")?;
        Ok(Self { out })
    }

    fn row(&mut self, seq: i64, packet_size: usize, decoded_size: usize) -> Result<()> {
        write!(self.out, "{}\t{}\t{}\r\n", seq, packet_size, decoded_size)?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        // gnuplot end-of-data marker
        write!(self.out, "\r\n\r\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Decoder, PCM file and plot for one direction
struct Track<D> {
    decoder: D,
    pcm: BufWriter<File>,
    plot: PlotFile,
    decoded: Vec<f32>,
    packets: u64,
}

impl<D: FrameDecoder> Track<D> {
    fn create(dir: &Path, direction: Direction, decoder: D) -> Result<Self> {
        let prefix = direction.file_prefix();
        let frame = decoder.frame_size();
        Ok(Self {
            decoder,
            pcm: BufWriter::new(File::create(dir.join(format!("{}_voice.f32", prefix)))?),
            plot: PlotFile::create(&dir.join(format!("{}_packetsizes.plot", prefix)))?,
            decoded: vec![0.0; frame],
            packets: 0,
        })
    }

    fn finish(mut self) -> Result<u64> {
        self.pcm.flush()?;
        self.plot.finish()?;
        Ok(self.packets)
    }
}

/// Counters from a finished replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub local_packets: u64,
    pub remote_packets: u64,
    /// Records that could not be split or decoded
    pub skipped: u64,
}

/// Decodes a dump into per-direction PCM and plot files
pub struct Replay<D: FrameDecoder = OpusDecoder> {
    header: HeaderFormat,
    local: Track<D>,
    remote: Track<D>,
    skipped: u64,
}

impl Replay<OpusDecoder> {
    /// Replay 48 kHz mono voice into `dir`
    pub fn opus(dir: &Path, header: HeaderFormat, sample_rate: u32) -> Result<Self> {
        Self::new(
            dir,
            header,
            OpusDecoder::voice(sample_rate)?,
            OpusDecoder::voice(sample_rate)?,
        )
    }
}

impl<D: FrameDecoder> Replay<D> {
    /// Each direction gets its own decoder, their states must not mix
    pub fn new(dir: &Path, header: HeaderFormat, local: D, remote: D) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            header,
            local: Track::create(dir, Direction::Local, local)?,
            remote: Track::create(dir, Direction::Remote, remote)?,
            skipped: 0,
        })
    }

    /// Decode one record; undecodable records are logged and skipped
    pub fn feed(&mut self, record: &DumpRecord) -> Result<()> {
        let header_format = self.header;
        let track = match record.direction {
            Direction::Local => &mut self.local,
            Direction::Remote => &mut self.remote,
        };

        let (header, payload) = match header_format.split(&record.packet) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Skipping {:?} record: {}", record.direction, e);
                self.skipped += 1;
                return Ok(());
            }
        };

        let seq = match header {
            PacketHeader::Sequence(seq) => seq as i64,
            PacketHeader::Timestamp(ms) => ms,
            PacketHeader::None => track.packets as i64,
        };

        let decoded = match track.decoder.decode(Some(payload), &mut track.decoded) {
            Ok(samples) => samples,
            Err(CodecError::ShortDecode { expected, actual }) => {
                warn!("Short decode, decoded {} samples, required {}", actual, expected);
                actual.min(expected)
            }
            Err(e) => {
                warn!("Skipping undecodable {:?} record: {}", record.direction, e);
                self.skipped += 1;
                return Ok(());
            }
        };

        for sample in &track.decoded[..decoded] {
            track.pcm.write_all(&sample.to_le_bytes())?;
        }
        track.plot.row(seq, record.packet.len(), decoded * std::mem::size_of::<f32>())?;
        track.packets += 1;
        Ok(())
    }

    /// Run every record from `records` through the replay
    pub fn run<I>(mut self, records: I) -> Result<ReplaySummary>
    where
        I: IntoIterator<Item = Result<DumpRecord>>,
    {
        for record in records {
            self.feed(&record?)?;
        }
        self.finish()
    }

    pub fn finish(self) -> Result<ReplaySummary> {
        Ok(ReplaySummary {
            local_packets: self.local.finish()?,
            remote_packets: self.remote.finish()?,
            skipped: self.skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("voicebridge-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Writes the first payload byte into every sample
    struct ByteDecoder;

    impl FrameDecoder for ByteDecoder {
        fn frame_size(&self) -> usize {
            4
        }

        fn decode(&mut self, payload: Option<&[u8]>, out: &mut [f32]) -> std::result::Result<usize, CodecError> {
            match payload {
                Some([]) => Err(CodecError::DecodingFailed("empty".into())),
                Some(p) => {
                    out.fill(p[0] as f32);
                    Ok(out.len())
                }
                None => {
                    out.fill(0.0);
                    Ok(out.len())
                }
            }
        }
    }

    #[test]
    fn test_writer_and_reader() {
        let dir = scratch_dir("dump");
        let path = dir.join("dump.bin");

        let writer = DumpWriter::create(&path).unwrap();
        let tap = writer.tap();
        tap.record(Direction::Local, &[1, 2, 3]);
        tap.record(Direction::Remote, &[4]);
        assert_eq!(writer.finish().unwrap(), 2);

        let records: Vec<DumpRecord> = read_dump(&path).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, Direction::Local);
        assert_eq!(records[0].packet, vec![1, 2, 3]);
        assert_eq!(records[1].direction, Direction::Remote);
        assert!(records[0].stamp <= records[1].stamp);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_replay_splits_directions() {
        let dir = scratch_dir("replay");
        let records = vec![
            DumpRecord { direction: Direction::Local, stamp: Utc::now(), packet: vec![0, 0, 0, 7, 2] },
            DumpRecord { direction: Direction::Remote, stamp: Utc::now(), packet: vec![0, 0, 0, 1, 3] },
            DumpRecord { direction: Direction::Remote, stamp: Utc::now(), packet: vec![0, 0] },
            DumpRecord { direction: Direction::Local, stamp: Utc::now(), packet: vec![0, 0, 0, 8] },
        ];

        let replay = Replay::new(&dir, HeaderFormat::Sequence, ByteDecoder, ByteDecoder).unwrap();
        let summary = replay.run(records.into_iter().map(Ok)).unwrap();
        assert_eq!(
            summary,
            ReplaySummary { local_packets: 1, remote_packets: 1, skipped: 2 }
        );

        let local = std::fs::read(dir.join("local_voice.f32")).unwrap();
        assert_eq!(local.len(), 4 * 4);
        assert_eq!(&local[..4], &2.0f32.to_le_bytes());

        let plot = std::fs::read_to_string(dir.join("remote_packetsizes.plot")).unwrap();
        assert!(plot.starts_with("# gnuplot data for packet dump tracing\r\n# seq\tpacket_size\tdecoded size\r\n"));
        assert!(plot.contains("1\t5\t16\r\n"));
        assert!(plot.ends_with("\r\n\r\n"));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_truncated_dump_reports_error() {
        let dir = scratch_dir("truncated");
        let path = dir.join("dump.bin");
        let record = DumpRecord { direction: Direction::Local, stamp: Utc::now(), packet: vec![9; 16] };
        let mut bytes = bincode::serialize(&record).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, bytes).unwrap();

        let results: Vec<_> = read_dump(&path).unwrap().collect();
        assert!(results.is_empty() || results[0].is_err());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_corrupt_record_is_a_dump_fault() {
        let dir = scratch_dir("corrupt");
        let path = dir.join("dump.bin");
        // Direction tag 9 names no variant
        let mut bytes = vec![9, 0, 0, 0];
        bytes.extend_from_slice(&[0; 32]);
        std::fs::write(&path, bytes).unwrap();

        let mut reader = read_dump(&path).unwrap();
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, Error::Dump(DumpError::Corrupt(_))));
        assert_eq!(err.fault_kind(), crate::error::FaultKind::Dump);
        assert!(reader.next().is_none());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
