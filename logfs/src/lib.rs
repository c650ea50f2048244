//! Logfs is a log-structured write-coalescing layer for parallel file I/O.  Each process of a
//! group journals its writes, view changes, resizes, and syncs to a private pair of append-only
//! logs; the logs are replayed later, on close or on the first read, to materialize the canonical
//! file as sorted, coalesced extents.  Workloads that issue many small strided writes pay for one
//! sequential log append per write and one coalesced pass at replay time instead of a seek per
//! write.

extern crate prototk;
#[macro_use]
extern crate prototk_derive;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use biometrics::{Collector, Counter};

use indicio::clue;

use tatl::HeyListen;

use utilz::stopwatch::Stopwatch;

use writering::WriteRing;

use zerror::{iotoz, Z};
use zerror_core::ErrorCore;
use zerror_derive::Z as ZerrorCore;

pub mod aggregate;
pub mod group;
pub mod logfile;
pub mod replay;
pub mod superblock;
pub mod typemap;

use group::Group;
use logfile::{FileLog, LogChannel, LogFile, RingStore};
use replay::{FlushExtent, FlushTarget, RangeTree, TreeBuilder};
use superblock::{SentinelLock, Superblock, MODE_ACTIVE, MODE_REPLAY};
use typemap::{calc_access, calc_range};

pub use group::{LocalGroup, Solo};
pub use replay::DATALOG_INVALID;
pub use typemap::Typemap;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACTIVATE: Counter = Counter::new("logfs.activate");
static DEACTIVATE: Counter = Counter::new("logfs.deactivate");
static WRITE_DATA: Counter = Counter::new("logfs.write_data");
static READ_DATA: Counter = Counter::new("logfs.read_data");
static REPLAY: Counter = Counter::new("logfs.replay");
static TREE_DROPPED: Counter = Counter::new("logfs.tree_dropped");

/// Register the biometrics for logfs and everything under it.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ACTIVATE);
    collector.register_counter(&DEACTIVATE);
    collector.register_counter(&WRITE_DATA);
    collector.register_counter(&READ_DATA);
    collector.register_counter(&REPLAY);
    collector.register_counter(&TREE_DROPPED);
    logfile::register_biometrics(collector);
    replay::register_biometrics(collector);
    superblock::register_biometrics(collector);
    writering::register_biometrics(collector);
}

/// Register the monitors for logfs and everything under it.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    superblock::register_monitors(hey_listen);
    writering::register_monitors(hey_listen);
}

/// The collector for this crate's clues.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Hint:  one of track_none, track_some, track_phased, track_all.
pub const HINT_READMODE: &str = "logfs_readmode";
/// Hint:  verbose tracing.
pub const HINT_DEBUG: &str = "logfs_debug";
/// Hint:  emit replay timings.
pub const HINT_TIMEREPLAY: &str = "logfs_timereplay";
/// Hint:  writering bank count for the data log.
pub const HINT_DATABLOCKCOUNT: &str = "logfs_datablockcount";
/// Hint:  block size in bytes for the data log.
pub const HINT_DATABLOCKSIZE: &str = "logfs_datablocksize";
/// Hint:  writering bank count for the meta log.
pub const HINT_METABLOCKCOUNT: &str = "logfs_metablockcount";
/// Hint:  block size in bytes for the meta log.
pub const HINT_METABLOCKSIZE: &str = "logfs_metablocksize";
/// Hint:  staging buffer size during replay.
pub const HINT_FLUSHBLOCKSIZE: &str = "logfs_flushblocksize";
/// Hint:  disable ring buffering.
pub const HINT_SYNC: &str = "logfs_sync";
/// Hint:  directory/base for the per-rank log files.
pub const HINT_LOGBASE: &str = "logfs_info_logbase";
/// Hint:  materialize the canonical file on close.
pub const HINT_REPLAYONCLOSE: &str = "logfs_replayonclose";

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// Error for logfs.
#[derive(Clone, Message, ZerrorCore)]
pub enum Error {
    #[prototk(557056, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(557057, message)]
    Corruption {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(557058, message)]
    GroupMismatch {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, int32)]
        created_with: i32,
        #[prototk(3, int32)]
        reopened_with: i32,
    },
    #[prototk(557059, message)]
    Locked {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        path: String,
    },
    #[prototk(557060, message)]
    InvalidArgument {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(557061, message)]
    ReadOnly {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(557062, message)]
    SystemError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(557063, message)]
    LogicError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        context: String,
    },
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

iotoz! {Error}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

impl From<writering::Error> for Error {
    fn from(what: writering::Error) -> Error {
        match what {
            writering::Error::Success { core } => Error::Success { core },
            writering::Error::SystemError { core, what } => Error::SystemError { core, what },
            writering::Error::TruncatedWrite {
                core,
                offset,
                expected,
                written,
            } => Error::SystemError {
                core,
                what: format!(
                    "truncated write at {}: {} of {} bytes",
                    offset, written, expected
                ),
            },
            writering::Error::LogicError { core, context } => Error::LogicError { core, context },
        }
    }
}

///////////////////////////////////////////// ReadMode /////////////////////////////////////////////

/// How much read support the coordinator maintains.  The range tree is kept current on every
/// write only under [ReadMode::Full]; the cheaper modes rebuild it from the meta log when a read
/// actually happens.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ReadMode {
    /// Write-only:  no tracking at all.
    None,
    /// Reads allowed but not expected.
    Some,
    /// Reads arrive in phases separated by syncs.
    Phased,
    /// Full write tracking.
    Full,
}

impl ReadMode {
    /// Parse a readmode hint value.
    pub fn parse(s: &str) -> Option<ReadMode> {
        match s {
            "track_none" => Some(ReadMode::None),
            "track_some" => Some(ReadMode::Some),
            "track_phased" => Some(ReadMode::Phased),
            "track_all" => Some(ReadMode::Full),
            _ => None,
        }
    }

    /// The hint value for this readmode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMode::None => "track_none",
            ReadMode::Some => "track_some",
            ReadMode::Phased => "track_phased",
            ReadMode::Full => "track_all",
        }
    }
}

/////////////////////////////////////////// LogFsOptions ///////////////////////////////////////////

/// Options for a logfs instance.  The same knobs arrive through the hint dictionary (see the
/// `HINT_*` keys) or the command line.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct LogFsOptions {
    /// Verbose tracing.
    #[cfg_attr(feature = "command_line", arrrg(flag, "Enable verbose tracing."))]
    pub debug: bool,
    /// Requested readmode:  track_none, track_some, track_phased, or track_all.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Read tracking mode."))]
    pub readmode: String,
    /// Number of writering banks for the data log.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Data log bank count."))]
    pub datablockcount: usize,
    /// Block size in bytes for the data log.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Data log block size in bytes."))]
    pub datablocksize: usize,
    /// Number of writering banks for the meta log.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Meta log bank count."))]
    pub metablockcount: usize,
    /// Block size in bytes for the meta log.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Meta log block size in bytes."))]
    pub metablocksize: usize,
    /// Staging buffer size during replay.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Replay staging buffer size in bytes."))]
    pub flushblocksize: usize,
    /// Disable ring buffering and write through.
    #[cfg_attr(feature = "command_line", arrrg(flag, "Disable ring buffering."))]
    pub sync: bool,
    /// Base path the per-rank log files hang off of; empty means next to the real file.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Base path for the log files."))]
    pub logfilebase: String,
    /// Materialize the canonical file when the group closes the file.
    #[cfg_attr(feature = "command_line", arrrg(flag, "Replay the logs on close."))]
    pub replayonclose: bool,
    /// Emit replay timings.
    #[cfg_attr(feature = "command_line", arrrg(flag, "Emit replay timings."))]
    pub timereplay: bool,
}

impl Default for LogFsOptions {
    fn default() -> Self {
        Self {
            debug: false,
            readmode: "track_some".to_string(),
            datablockcount: 2,
            datablocksize: 4 * 1024 * 1024,
            metablockcount: 2,
            metablocksize: 64 * 1024,
            flushblocksize: 1024 * 1024,
            sync: false,
            logfilebase: String::new(),
            replayonclose: false,
            timereplay: true,
        }
    }
}

impl LogFsOptions {
    /// Fold the hint dictionary into these options.  Unknown values are ignored with a warning
    /// clue.
    pub fn load(&mut self, info: &BTreeMap<String, String>) {
        if let Some(v) = info.get(HINT_DEBUG) {
            self.debug = parse_bool(HINT_DEBUG, v, self.debug);
        }
        if let Some(v) = info.get(HINT_DATABLOCKCOUNT) {
            self.datablockcount = parse_usize(HINT_DATABLOCKCOUNT, v, self.datablockcount);
        }
        if let Some(v) = info.get(HINT_DATABLOCKSIZE) {
            self.datablocksize = parse_usize(HINT_DATABLOCKSIZE, v, self.datablocksize);
        }
        if let Some(v) = info.get(HINT_METABLOCKCOUNT) {
            self.metablockcount = parse_usize(HINT_METABLOCKCOUNT, v, self.metablockcount);
        }
        if let Some(v) = info.get(HINT_METABLOCKSIZE) {
            self.metablocksize = parse_usize(HINT_METABLOCKSIZE, v, self.metablocksize);
        }
        if let Some(v) = info.get(HINT_FLUSHBLOCKSIZE) {
            self.flushblocksize = parse_usize(HINT_FLUSHBLOCKSIZE, v, self.flushblocksize);
        }
        if let Some(v) = info.get(HINT_SYNC) {
            self.sync = parse_bool(HINT_SYNC, v, self.sync);
        }
        if let Some(v) = info.get(HINT_LOGBASE) {
            self.logfilebase = v.clone();
        }
        if let Some(v) = info.get(HINT_REPLAYONCLOSE) {
            self.replayonclose = parse_bool(HINT_REPLAYONCLOSE, v, self.replayonclose);
        }
        if let Some(v) = info.get(HINT_TIMEREPLAY) {
            self.timereplay = parse_bool(HINT_TIMEREPLAY, v, self.timereplay);
        }
        if let Some(v) = info.get(HINT_READMODE) {
            if ReadMode::parse(v).is_some() {
                self.readmode = v.clone();
            } else {
                clue!(COLLECTOR, indicio::WARNING, {
                    unknown_readmode: v.clone(),
                });
            }
        }
    }

    /// Apply the environment overrides:  LOGFS_DEBUG and LOGFS_TIMEREPLAY force the flags on.
    pub fn load_env(&mut self) {
        if std::env::var_os("LOGFS_DEBUG").is_some() {
            self.debug = true;
        }
        if std::env::var_os("LOGFS_TIMEREPLAY").is_some() {
            self.timereplay = true;
        }
    }

    /// Write every option back into a hint dictionary.
    pub fn store(&self, info: &mut BTreeMap<String, String>) {
        info.insert(HINT_DEBUG.to_string(), bool_str(self.debug));
        info.insert(HINT_READMODE.to_string(), self.readmode.clone());
        info.insert(
            HINT_DATABLOCKCOUNT.to_string(),
            self.datablockcount.to_string(),
        );
        info.insert(
            HINT_DATABLOCKSIZE.to_string(),
            self.datablocksize.to_string(),
        );
        info.insert(
            HINT_METABLOCKCOUNT.to_string(),
            self.metablockcount.to_string(),
        );
        info.insert(
            HINT_METABLOCKSIZE.to_string(),
            self.metablocksize.to_string(),
        );
        info.insert(
            HINT_FLUSHBLOCKSIZE.to_string(),
            self.flushblocksize.to_string(),
        );
        info.insert(HINT_SYNC.to_string(), bool_str(self.sync));
        info.insert(HINT_LOGBASE.to_string(), self.logfilebase.clone());
        info.insert(HINT_REPLAYONCLOSE.to_string(), bool_str(self.replayonclose));
        info.insert(HINT_TIMEREPLAY.to_string(), bool_str(self.timereplay));
    }
}

/// Fill `dest` with the fully defaulted view of the hints in `source`.
pub fn transfer_hints(source: &BTreeMap<String, String>, dest: &mut BTreeMap<String, String>) {
    let mut options = LogFsOptions::default();
    options.load_env();
    options.load(source);
    options.store(dest);
}

fn bool_str(b: bool) -> String {
    if b { "true" } else { "false" }.to_string()
}

fn parse_bool(key: &str, value: &str, default: bool) -> bool {
    match value {
        "1" | "true" | "yes" | "on" | "enable" => true,
        "0" | "false" | "no" | "off" | "disable" => false,
        _ => {
            clue!(COLLECTOR, indicio::WARNING, {
                bad_hint: {
                    key: key,
                    value: value,
                },
            });
            default
        }
    }
}

fn parse_usize(key: &str, value: &str, default: usize) -> usize {
    match value.parse::<usize>() {
        Ok(parsed) => parsed,
        Err(_) => {
            clue!(COLLECTOR, indicio::WARNING, {
                bad_hint: {
                    key: key,
                    value: value,
                },
            });
            default
        }
    }
}

//////////////////////////////////////////// AccessMode ////////////////////////////////////////////

/// How the user opened the file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

////////////////////////////////////////////// paths ///////////////////////////////////////////////

// A leading "logfs:" prefix would recurse back into this layer; strip it.
fn strip_prefix(name: &str) -> &str {
    name.strip_prefix("logfs:").unwrap_or(name)
}

/// The superblock path for a canonical file.
pub fn superblock_path(real: &str) -> PathBuf {
    PathBuf::from(format!("{}.logfs", real))
}

/// The lockfile path for a canonical file.
pub fn lockfile_path(real: &str) -> PathBuf {
    PathBuf::from(format!("{}.logfslock", real))
}

/// The per-rank log file path:  `<base>.<rank>.meta` or `<base>.<rank>.data`.
pub fn log_path(base: &str, rank: usize, chan: LogChannel) -> PathBuf {
    let suffix = match chan {
        LogChannel::Meta => "meta",
        LogChannel::Data => "data",
    };
    PathBuf::from(format!("{}.{}.{}", base, rank, suffix))
}

// Hint beats environment beats putting the logs next to the real file.
fn resolve_logfile_base(options: &LogFsOptions, real: &str) -> String {
    if !options.logfilebase.is_empty() {
        return options.logfilebase.clone();
    }
    if let Ok(env) = std::env::var("LOGFSTMP") {
        if !env.is_empty() {
            return env;
        }
    }
    real.to_string()
}

fn remove_quietly(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/////////////////////////////////////////////// View ///////////////////////////////////////////////

#[derive(Clone, Debug)]
struct View {
    displacement: i64,
    etype: Typemap,
    ftype: Typemap,
}

impl View {
    fn etype_size(&self) -> i64 {
        std::cmp::max(1, self.etype.size())
    }
}

impl Default for View {
    fn default() -> Self {
        Self {
            displacement: 0,
            etype: Typemap::byte(),
            ftype: Typemap::byte(),
        }
    }
}

/////////////////////////////////////////// flush target ///////////////////////////////////////////

// The production flush target:  reads straight from the (flushed) data log, writes to the
// canonical file.
struct CanonicalTarget<'a> {
    canonical: &'a File,
    datalog_path: &'a Path,
    datalog: Option<File>,
}

impl<'a> FlushTarget for CanonicalTarget<'a> {
    fn start(&mut self, _collective: bool) -> Result<(), Error> {
        Ok(())
    }

    fn read_start(&mut self, buf: &mut [u8], extents: &[FlushExtent]) -> Result<(), Error> {
        if extents.is_empty() {
            return Ok(());
        }
        if self.datalog.is_none() {
            self.datalog = Some(File::open(self.datalog_path)?);
        }
        let datalog = match self.datalog.as_ref() {
            Some(file) => file,
            None => {
                return Err(Error::LogicError {
                    core: ErrorCore::default(),
                    context: "data log handle missing".to_string(),
                });
            }
        };
        for extent in extents.iter() {
            let len = extent.len as usize;
            datalog.read_exact_at(&mut buf[extent.bufofs..extent.bufofs + len], extent.datalog as u64)?;
        }
        Ok(())
    }

    fn read_wait(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn write_start(
        &mut self,
        buf: &[u8],
        extents: &[FlushExtent],
        _bytes: i64,
    ) -> Result<(), Error> {
        for extent in extents.iter() {
            let len = extent.len as usize;
            self.canonical
                .write_all_at(&buf[extent.bufofs..extent.bufofs + len], extent.canonical as u64)?;
        }
        Ok(())
    }

    fn write_wait(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/////////////////////////////////////////////// LogFs //////////////////////////////////////////////

/// One rank's view of an open logfs file.  Collective operations must be called in lockstep by
/// every rank of the group.
pub struct LogFs<G: Group> {
    options: LogFsOptions,
    readmode: ReadMode,
    group: G,
    mode: AccessMode,
    real_name: String,
    superblock: Superblock,
    superblock_path: PathBuf,
    superblock_file: Option<File>,
    lock: Option<SentinelLock>,
    logfile: LogFile<RingStore>,
    meta_log_path: PathBuf,
    data_log_path: PathBuf,
    tree: RangeTree,
    rtree_valid: bool,
    file_valid: bool,
    filesize: i64,
    view: View,
    realfile_single: Option<File>,
    realfile_collective: Option<File>,
}

impl<G: Group> LogFs<G> {
    /// Open the file for logging.  Collective.  Acquires the lockfile, loads or creates the
    /// superblock, and wires up the per-rank logs; the log files themselves are not touched until
    /// the first record is written.
    pub fn activate(
        options: LogFsOptions,
        group: G,
        filename: &str,
        mode: AccessMode,
        standalone: bool,
    ) -> Result<Self, Error> {
        ACTIVATE.click();
        let mut options = options;
        options.load_env();
        let mut readmode = match mode {
            AccessMode::WriteOnly => ReadMode::None,
            _ => ReadMode::Some,
        };
        if readmode > ReadMode::None {
            if let Some(requested) = ReadMode::parse(&options.readmode) {
                if requested > ReadMode::None {
                    readmode = requested;
                }
            }
        }
        let real_name = strip_prefix(filename).to_string();
        let superblock_path = superblock_path(&real_name);
        let lockfile_path = lockfile_path(&real_name);
        let base = resolve_logfile_base(&options, &real_name);
        if options.debug {
            clue!(COLLECTOR, indicio::INFO, {
                activate: {
                    file: real_name.clone(),
                    readmode: readmode.as_str(),
                    base: base.clone(),
                },
            });
        }
        // Rank zero takes the lock and settles the superblock; everybody learns the outcome from
        // the broadcast.
        let mut lock = None;
        let mut superblock_file = None;
        let mut status: i32 = 0;
        let mut sb = Superblock::default();
        if group.rank() == 0 {
            match SentinelLock::acquire(&lockfile_path) {
                Ok(Some(acquired)) => lock = Some(acquired),
                Ok(None) => status = 1,
                Err(_) => status = 3,
            }
            if status == 0 {
                match Superblock::read_from(&superblock_path) {
                    Ok(Some(mut found)) => {
                        found.epoch += 1;
                        if found.logfile_count as usize != group.size() {
                            status = 2;
                        }
                        sb = found;
                    }
                    Ok(None) => {
                        sb = Superblock {
                            flags: MODE_ACTIVE,
                            logfile_count: group.size() as i32,
                            epoch: 0,
                            logfile_base: base.clone(),
                        };
                    }
                    Err(_) => status = 4,
                }
            }
            if status == 0 {
                sb.flags = MODE_ACTIVE;
                match superblock::open_superblock(&superblock_path) {
                    Ok(file) => match sb.store(&file) {
                        Ok(()) => superblock_file = Some(file),
                        Err(_) => status = 3,
                    },
                    Err(_) => status = 3,
                }
            }
        }
        let mut payload = Vec::with_capacity(4 + superblock::SUPERBLOCK_SIZE);
        payload.extend_from_slice(&status.to_ne_bytes());
        payload.extend_from_slice(&sb.encode());
        group.broadcast(0, &mut payload)?;
        if payload.len() < 4 + superblock::SUPERBLOCK_SIZE {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                context: "activation broadcast is short".to_string(),
            });
        }
        let status = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let sb = Superblock::decode(&payload[4..])?;
        match status {
            0 => {}
            1 => {
                clue!(COLLECTOR, indicio::ERROR, {
                    locked: {
                        file: real_name.clone(),
                        lockfile: lockfile_path.to_string_lossy().to_string(),
                        hint: "if nothing else has the file open, remove the stale lockfile",
                    },
                });
                return Err(Error::Locked {
                    core: ErrorCore::default(),
                    path: lockfile_path.to_string_lossy().to_string(),
                });
            }
            2 => {
                return Err(Error::GroupMismatch {
                    core: ErrorCore::default(),
                    created_with: sb.logfile_count,
                    reopened_with: group.size() as i32,
                });
            }
            4 => {
                return Err(Error::Corruption {
                    core: ErrorCore::default(),
                    what: "superblock failed to load".to_string(),
                });
            }
            _ => {
                return Err(Error::SystemError {
                    core: ErrorCore::default(),
                    what: "activation failed on rank zero".to_string(),
                });
            }
        }
        // The per-rank logs and the rings in front of them.
        let meta_log_path = log_path(&base, group.rank(), LogChannel::Meta);
        let data_log_path = log_path(&base, group.rank(), LogChannel::Data);
        let (read, write) = match mode {
            AccessMode::WriteOnly => (false, true),
            // Read-only still opens the logs for writing so replay can truncate them.
            AccessMode::ReadOnly => (true, true),
            AccessMode::ReadWrite => (true, true),
        };
        let data_ring = WriteRing::new(
            options.datablocksize,
            options.datablockcount,
            FileLog::new(&data_log_path),
            read,
            write,
        );
        let meta_ring = WriteRing::new(
            options.metablocksize,
            options.metablockcount,
            FileLog::new(&meta_log_path),
            read,
            write,
        );
        let mut store = RingStore::new(data_ring, meta_ring);
        store.set_sync(options.sync)?;
        store.set_debug(options.debug);
        let mut logfile = LogFile::new(store);
        logfile.set_epoch(sb.epoch);
        let mut logfs = Self {
            options,
            readmode,
            group,
            mode,
            real_name,
            superblock: sb,
            superblock_path,
            superblock_file,
            lock,
            logfile,
            meta_log_path,
            data_log_path,
            tree: RangeTree::new(),
            rtree_valid: true,
            file_valid: false,
            filesize: 0,
            view: View::default(),
            realfile_single: None,
            realfile_collective: None,
        };
        if standalone {
            logfs.ensure_canonical(true)?;
            if let Some(file) = logfs.realfile_collective.as_ref() {
                logfs.filesize = file.metadata()?.len() as i64;
            }
        } else {
            let mut size = 0u64;
            if logfs.group.rank() == 0 {
                size = match std::fs::metadata(&logfs.real_name) {
                    Ok(metadata) => metadata.len(),
                    Err(err) if err.kind() == ErrorKind::NotFound => 0,
                    Err(err) => {
                        return Err(err.into());
                    }
                };
            }
            let mut buf = size.to_ne_bytes().to_vec();
            logfs.group.broadcast(0, &mut buf)?;
            if buf.len() == 8 {
                let mut size = [0u8; 8];
                size.copy_from_slice(&buf);
                logfs.filesize = u64::from_ne_bytes(size) as i64;
            }
        }
        logfs.group.barrier()?;
        Ok(logfs)
    }

    /// This rank's id within the group.
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    /// The readmode the coordinator settled on.
    pub fn readmode(&self) -> ReadMode {
        self.readmode
    }

    /// The current epoch.
    pub fn epoch(&self) -> i32 {
        self.logfile.epoch()
    }

    /// Total bytes the range tree currently indexes.
    pub fn range_size(&self) -> i64 {
        self.tree.range_size()
    }

    /// Record a view change.  Collective.  The data representation is always "native".
    pub fn set_view(&mut self, displacement: i64, etype: Typemap, ftype: Typemap) {
        self.logfile
            .record_view(displacement, etype.clone(), ftype.clone());
        self.view = View {
            displacement,
            etype,
            ftype,
        };
    }

    /// Stage a write of `buf` at `offset` (in etypes, relative to the view displacement).
    /// Returns the data-log position the payload landed at.
    pub fn write_data(&mut self, offset: i64, buf: &[u8], _collective: bool) -> Result<i64, Error> {
        WRITE_DATA.click();
        let datalog_pos = self.logfile.record_write(buf, offset)?;
        let track_filesize = cfg!(feature = "track-filesize") || self.readmode > ReadMode::None;
        let update_tree = self.readmode >= ReadMode::Full;
        if !update_tree && self.rtree_valid {
            // An untracked write makes the tree worthless.
            TREE_DROPPED.click();
            self.tree.clear();
            self.rtree_valid = false;
        }
        if update_tree || track_filesize {
            self.track_write(offset, buf.len() as i64, update_tree, datalog_pos);
        }
        if !buf.is_empty() {
            self.file_valid = false;
        }
        Ok(datalog_pos)
    }

    /// Read `buf.len()` bytes at `offset` (in bytes, applied through the view's filetype).  A
    /// stale canonical file is materialized first unless the file is read-only.  Returns the
    /// bytes produced.
    pub fn read_data(
        &mut self,
        offset: i64,
        buf: &mut [u8],
        collective: bool,
    ) -> Result<usize, Error> {
        READ_DATA.click();
        if !self.file_valid && self.mode != AccessMode::ReadOnly {
            self.replay_helper(collective)?;
        }
        self.ensure_canonical(collective)?;
        let file = match if collective {
            self.realfile_collective.as_ref()
        } else {
            self.realfile_single.as_ref()
        } {
            Some(file) => file,
            None => {
                return Err(Error::LogicError {
                    core: ErrorCore::default(),
                    context: "canonical handle missing".to_string(),
                });
            }
        };
        let view = &self.view;
        let mut total = 0usize;
        let mut error: Option<Error> = None;
        calc_access(
            1,
            &view.ftype,
            view.displacement,
            offset,
            buf.len() as i64,
            &mut |start, len| {
                let want = len as usize;
                let mut got = 0usize;
                while got < want {
                    match file.read_at(&mut buf[total + got..total + want], start as u64 + got as u64)
                    {
                        Ok(0) => break,
                        Ok(n) => got += n,
                        Err(err) => {
                            error = Some(err.into());
                            return false;
                        }
                    }
                }
                total += got;
                got == want
            },
        );
        match error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    /// Record a new filesize.  Collective.
    pub fn resize(&mut self, size: i64) {
        self.logfile.record_setsize(size);
        self.filesize = size;
    }

    /// The canonical filesize as this rank tracks it.  Meaningless (and an error) in a write-only
    /// file without size tracking.
    pub fn get_filesize(&self) -> Result<i64, Error> {
        if !cfg!(feature = "track-filesize") && self.readmode == ReadMode::None {
            return Err(Error::ReadOnly {
                core: ErrorCore::default(),
            });
        }
        Ok(self.filesize)
    }

    /// Advance the epoch.  Collective.  The group agrees on the filesize, the range tree starts
    /// over, and any canonical handles are synced.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.logfile.record_sync();
        if !cfg!(feature = "track-filesize") && self.readmode > ReadMode::None {
            self.filesize = self.group.allreduce_max(self.filesize as u64)? as i64;
        }
        self.tree.clear();
        self.rtree_valid = true;
        if let Some(file) = self.realfile_single.as_ref() {
            file.sync_data()?;
        }
        if let Some(file) = self.realfile_collective.as_ref() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Push buffered log bytes to the log files.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.logfile.store_mut().flush_all()
    }

    /// Materialize the canonical file from the logs.  Collective when `collective` is set.
    pub fn replay(&mut self, collective: bool) -> Result<(), Error> {
        self.superblock.flags = MODE_REPLAY;
        self.update_superblock()?;
        self.replay_helper(collective)?;
        self.superblock.flags = MODE_ACTIVE;
        self.update_superblock()?;
        Ok(())
    }

    /// Close the file.  Collective.  With `replayonclose` set (and the file not read-only) the
    /// canonical file is materialized and the logs and superblock are removed; otherwise the
    /// superblock is marked inactive and the logs are kept for a future reopen.
    pub fn deactivate(mut self) -> Result<(), Error> {
        DEACTIVATE.click();
        let replay = self.options.replayonclose && self.mode != AccessMode::ReadOnly;
        if self.options.debug {
            clue!(COLLECTOR, indicio::INFO, {
                deactivate: {
                    file: self.real_name.clone(),
                    replay: bool_str(replay),
                },
            });
        }
        if replay {
            self.replay(true)?;
        }
        self.superblock.flags = 0;
        if replay {
            self.group.barrier()?;
            if self.group.rank() == 0 {
                self.superblock_file = None;
                Superblock::remove(&self.superblock_path)?;
            }
            self.group.barrier()?;
        } else {
            self.update_superblock()?;
        }
        self.logfile.finish()?;
        if replay {
            remove_quietly(&self.meta_log_path)?;
            remove_quietly(&self.data_log_path)?;
        }
        self.realfile_single = None;
        self.realfile_collective = None;
        if self.group.rank() == 0 {
            if let Some(lock) = self.lock.take() {
                lock.release()?;
            }
        }
        self.group.barrier()?;
        Ok(())
    }

    /// Fold a hint dictionary into the live instance.  Only the debug flag and readmode upgrades
    /// take effect after activation.
    pub fn set_info(&mut self, info: &BTreeMap<String, String>) {
        self.options.load(info);
        self.logfile.store_mut().set_debug(self.options.debug);
        if self.readmode > ReadMode::None {
            if let Some(requested) = ReadMode::parse(&self.options.readmode) {
                if requested > ReadMode::None {
                    self.readmode = requested;
                }
            }
        }
    }

    /// Write the effective options into a hint dictionary.
    pub fn get_info(&self, info: &mut BTreeMap<String, String>) {
        self.options.store(info);
        info.insert(HINT_READMODE.to_string(), self.readmode.as_str().to_string());
    }

    //////////////////////////////////////////// helpers ///////////////////////////////////////////

    fn update_superblock(&mut self) -> Result<(), Error> {
        if self.group.rank() != 0 {
            return Ok(());
        }
        match self.superblock_file.as_ref() {
            Some(file) => self.superblock.store(file),
            None => Ok(()),
        }
    }

    fn ensure_canonical(&mut self, collective: bool) -> Result<(), Error> {
        let slot = if collective {
            &mut self.realfile_collective
        } else {
            &mut self.realfile_single
        };
        if slot.is_some() {
            return Ok(());
        }
        let file = match self.mode {
            AccessMode::ReadOnly => OpenOptions::new().read(true).open(&self.real_name)?,
            _ => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.real_name)?,
        };
        *slot = Some(file);
        Ok(())
    }

    fn track_write(&mut self, offset: i64, size: i64, update_tree: bool, datalog_start: i64) {
        if !update_tree {
            let (_, stop) = calc_range(
                self.view.etype_size(),
                &self.view.ftype,
                self.view.displacement,
                offset,
                size,
            );
            if self.filesize < stop {
                self.filesize = stop;
            }
            return;
        }
        let view = &self.view;
        let tree = &mut self.tree;
        let mut local = 0i64;
        calc_access(
            view.etype_size(),
            &view.ftype,
            view.displacement,
            offset,
            size,
            &mut |start, len| {
                tree.add_split(start, start + len, datalog_start + local);
                local += len;
                true
            },
        );
        let stop = self.tree.get_range().stop;
        if self.filesize < stop {
            self.filesize = stop;
        }
    }

    // Rebuild the range tree from the whole meta log, then stream it into the canonical file and
    // truncate the logs.
    fn replay_helper(&mut self, collective: bool) -> Result<(), Error> {
        REPLAY.click();
        let stopwatch = Stopwatch::default();
        self.logfile.store_mut().flush_all()?;
        // The tree, even when valid, only covers the current epoch; materializing the file needs
        // every epoch, so rebuild from scratch.
        self.rtree_valid = false;
        self.tree.clear();
        let mut filesize = self.filesize;
        {
            let mut builder = TreeBuilder::new(&mut self.tree, &mut filesize);
            self.logfile.replay(false, &mut builder)?;
        }
        self.filesize = filesize;
        self.ensure_canonical(collective)?;
        let canonical = match if collective {
            self.realfile_collective.as_ref()
        } else {
            self.realfile_single.as_ref()
        } {
            Some(file) => file,
            None => {
                return Err(Error::LogicError {
                    core: ErrorCore::default(),
                    context: "canonical handle missing".to_string(),
                });
            }
        };
        let mut target = CanonicalTarget {
            canonical,
            datalog_path: &self.data_log_path,
            datalog: None,
        };
        let mut flushed_size = self.filesize;
        replay::flush(
            &self.tree,
            self.options.flushblocksize,
            &mut target,
            collective,
            &mut flushed_size,
            &self.group,
        )?;
        drop(target);
        let replayed = self.tree.range_size();
        if !self.tree.is_empty() {
            self.logfile.clear(false)?;
            self.tree.clear();
        }
        if self.options.debug || self.options.timereplay {
            clue!(COLLECTOR, indicio::INFO, {
                replay: {
                    file: self.real_name.clone(),
                    collective: bool_str(collective),
                    bytes: replayed as u64,
                    seconds: format!("{:.6}", stopwatch.since()),
                },
            });
        }
        self.file_valid = true;
        Ok(())
    }
}

/////////////////////////////////////////////// probe //////////////////////////////////////////////

/// True iff `filename` has a logfs superblock next to it.  Collective.
pub fn probe<G: Group>(group: &G, filename: &str) -> Result<bool, Error> {
    let mut found = 0u8;
    if group.rank() == 0 && Superblock::read_from(superblock_path(strip_prefix(filename)))?.is_some()
    {
        found = 1;
    }
    let mut buf = vec![found];
    group.broadcast(0, &mut buf)?;
    Ok(buf.first().copied().unwrap_or(0) != 0)
}

////////////////////////////////////////////// delete //////////////////////////////////////////////

/// Remove the superblock and every per-rank log for `filename`.  The canonical file itself is the
/// caller's to delete.  Returns false when there was no superblock to start from; log files that
/// are already gone are silently tolerated.
pub fn delete(filename: &str) -> Result<bool, Error> {
    let real = strip_prefix(filename);
    let path = superblock_path(real);
    let sb = match Superblock::read_from(&path)? {
        Some(sb) => sb,
        None => {
            return Ok(false);
        }
    };
    Superblock::remove(&path)?;
    for rank in 0..std::cmp::max(0, sb.logfile_count) as usize {
        remove_quietly(&log_path(&sb.logfile_base, rank, LogChannel::Meta))?;
        remove_quietly(&log_path(&sb.logfile_base, rank, LogChannel::Data))?;
    }
    Ok(true)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
