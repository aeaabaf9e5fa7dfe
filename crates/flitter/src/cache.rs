//! The shared file cache: path-keyed, mtime-validated, TTL-evicted.
//!
//! Every external artifact the engine reads — program source, text, CSV
//! rows, images, meshes, video frame windows — comes through here. Each
//! path carries one sub-cache per access kind; an entry remembers the file's
//! modification time at read and recomputes when it changes. Reads refresh a
//! last-touched timestamp and `clean` discards paths that have gone unused
//! longer than the TTL, releasing decoder handles.
//!
//! Decoding is not the cache's business: images, meshes and video streams
//! are produced by an [`AssetDecoders`] implementation supplied by the
//! embedder. The rolling video window and its seek policy are.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use ahash::AHashMap;
use tracing::{debug, trace, warn};

use crate::{
    errors::ParseError,
    simplify::Names,
    tree::Top,
    values::Vector,
};

/// The external parser interface: source text in, expression tree out.
pub trait ProgramParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<Top, ParseError>;
}

/// A decoded image.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<[u8]>,
}

/// Decoded geometry.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[u32; 3]>,
}

/// One decoded video frame with its stream position.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: i64,
    pub key_frame: bool,
    pub image: ImageData,
}

/// A seekable sequential video decoder, opened per path.
pub trait VideoStream: Send {
    /// Presentation timestamp of the first frame, in stream ticks.
    fn start_time(&self) -> i64;
    /// Stream duration in ticks.
    fn duration(&self) -> i64;
    /// Seconds per tick.
    fn time_base(&self) -> f64;
    /// Repositions decoding at or before `timestamp`.
    fn seek(&mut self, timestamp: i64);
    /// The next frame, or `None` at end of stream.
    fn decode_next(&mut self) -> Option<VideoFrame>;
}

/// Embedder-supplied media decoders.
pub trait AssetDecoders: Send + Sync {
    fn decode_image(&self, path: &Path) -> Result<ImageData, String>;
    fn decode_mesh(&self, path: &Path) -> Result<MeshData, String>;
    fn open_video(&self, path: &Path) -> Result<Box<dyn VideoStream>, String>;
}

/// A parsed-and-simplified program artifact, including the errors the
/// simplifier collected so the scheduler can surface them every frame.
#[derive(Debug)]
pub struct LoadedProgram {
    pub top: Top,
    pub errors: BTreeSet<String>,
}

type FileStamp = Option<SystemTime>;

struct ProgramSlot {
    stamp: FileStamp,
    program: Option<Arc<LoadedProgram>>,
}

struct CsvSlot {
    stamp: FileStamp,
    rows: Vec<Vector>,
    /// The streaming reader; `None` once exhausted or failed.
    reader: Option<csv::Reader<fs::File>>,
}

struct VideoSlot {
    stamp: FileStamp,
    stream: Option<Box<dyn VideoStream>>,
    /// The rolling window; a trailing `None` marks end of stream.
    frames: Vec<Option<Arc<VideoFrame>>>,
}

/// Decode steps allowed per read before giving up on reaching the target.
const MAX_DECODE_STEPS: usize = 4096;

/// One cached path and its per-kind sub-caches.
pub struct CachePath {
    path: PathBuf,
    touched: Instant,
    decoders: Option<Arc<dyn AssetDecoders>>,
    text: Option<(FileStamp, Option<Arc<str>>)>,
    program: Option<ProgramSlot>,
    csv: Option<CsvSlot>,
    image: Option<(FileStamp, Option<Arc<ImageData>>)>,
    mesh: Option<(FileStamp, Option<Arc<MeshData>>)>,
    videos: AHashMap<u64, VideoSlot>,
}

impl CachePath {
    fn new(path: PathBuf, decoders: Option<Arc<dyn AssetDecoders>>) -> Self {
        Self {
            path,
            touched: Instant::now(),
            decoders,
            text: None,
            program: None,
            csv: None,
            image: None,
            mesh: None,
            videos: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn touch(&mut self) {
        self.touched = Instant::now();
    }

    fn stamp(&self) -> FileStamp {
        fs::metadata(&self.path).ok().and_then(|meta| meta.modified().ok())
    }

    /// Releases held resources; called on eviction and shutdown.
    pub fn cleanup(&mut self) {
        for (_, slot) in self.videos.drain() {
            if slot.stream.is_some() {
                debug!(path = %self.path.display(), "closing video file");
            }
        }
        self.text = None;
        self.program = None;
        self.csv = None;
        self.image = None;
        self.mesh = None;
    }

    /// The file's text, re-read when the modification time changes.
    pub fn read_text(&mut self) -> Option<Arc<str>> {
        self.touch();
        let stamp = self.stamp();
        if let Some((cached_stamp, text)) = &self.text
            && *cached_stamp == stamp
        {
            return text.clone();
        }
        let text = if stamp.is_none() {
            warn!(path = %self.path.display(), "file not found");
            None
        } else {
            match fs::read_to_string(&self.path) {
                Ok(text) => {
                    debug!(path = %self.path.display(), "read text file");
                    Some(Arc::from(text.as_str()))
                }
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "error reading text file");
                    None
                }
            }
        };
        self.text = Some((stamp, text.clone()));
        text
    }

    /// The parsed-and-simplified program for this path.
    ///
    /// Re-reads on modification-time changes. A failed re-parse keeps the
    /// last good artifact and warns; a failed first parse leaves the page
    /// without a program. With `simplify` off the parsed tree is returned
    /// untouched (the scheduler's escape hatch).
    pub fn read_program(
        &mut self,
        names: &Names,
        parser: &dyn ProgramParser,
        simplify: bool,
    ) -> Option<Arc<LoadedProgram>> {
        self.touch();
        let stamp = self.stamp();
        if let Some(slot) = &self.program
            && slot.stamp == stamp
        {
            return slot.program.clone();
        }
        let mut program = self.program.take().and_then(|slot| slot.program);
        if stamp.is_none() {
            warn!(path = %self.path.display(), "program file not found");
            program = None;
        } else {
            match fs::read_to_string(&self.path) {
                Ok(source) => match parser.parse(&source) {
                    Ok(parsed) => {
                        let started = Instant::now();
                        let loaded = if simplify {
                            let before = parsed.count_expressions();
                            let (top, simplification) = parsed.simplify(names, None);
                            debug!(
                                path = %self.path.display(),
                                before,
                                after = top.count_expressions(),
                                elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
                                "parsed and partially evaluated program"
                            );
                            LoadedProgram {
                                top,
                                errors: simplification.errors,
                            }
                        } else {
                            LoadedProgram {
                                top: parsed,
                                errors: BTreeSet::new(),
                            }
                        };
                        program = Some(Arc::new(loaded));
                    }
                    Err(error) => {
                        if program.is_none() {
                            tracing::error!(path = %self.path.display(), %error, "error parsing program");
                        } else {
                            warn!(path = %self.path.display(), %error, "unable to re-parse program, keeping previous");
                        }
                    }
                },
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "error reading program file");
                    program = None;
                }
            }
        }
        self.program = Some(ProgramSlot { stamp, program: program.clone() });
        program
    }

    /// Row `row` of the file parsed as CSV, memoizing a streaming reader.
    /// Numeric cells become numbers; anything else becomes a symbol. Out of
    /// range rows are null.
    pub fn read_csv_row(&mut self, row: usize) -> Vector {
        self.touch();
        let stamp = self.stamp();
        let valid = matches!(&self.csv, Some(slot) if slot.stamp == stamp);
        if !valid {
            let reader = if stamp.is_none() {
                warn!(path = %self.path.display(), "file not found");
                None
            } else {
                match fs::File::open(&self.path) {
                    Ok(file) => {
                        debug!(path = %self.path.display(), "opened CSV file");
                        Some(
                            csv::ReaderBuilder::new()
                                .has_headers(false)
                                .flexible(true)
                                .from_reader(file),
                        )
                    }
                    Err(error) => {
                        warn!(path = %self.path.display(), %error, "error reading CSV file");
                        None
                    }
                }
            };
            self.csv = Some(CsvSlot {
                stamp,
                rows: Vec::new(),
                reader,
            });
        }
        let slot = self.csv.as_mut().expect("csv slot initialized");
        let mut record = csv::StringRecord::new();
        while slot.rows.len() <= row {
            let Some(reader) = slot.reader.as_mut() else {
                break;
            };
            match reader.read_record(&mut record) {
                Ok(true) => slot.rows.push(row_vector(&record)),
                Ok(false) => {
                    debug!(path = %self.path.display(), "closed CSV file");
                    slot.reader = None;
                }
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "error reading CSV file");
                    slot.reader = None;
                }
            }
        }
        slot.rows.get(row).cloned().unwrap_or_else(Vector::null)
    }

    /// The decoded image, re-read on modification-time changes.
    pub fn read_image(&mut self) -> Option<Arc<ImageData>> {
        self.touch();
        let stamp = self.stamp();
        if let Some((cached_stamp, image)) = &self.image
            && *cached_stamp == stamp
        {
            return image.clone();
        }
        let image = self.decode_asset(stamp, "image", |decoders, path| {
            decoders.decode_image(path).map(Arc::new)
        });
        self.image = Some((stamp, image.clone()));
        image
    }

    /// The decoded mesh, re-read on modification-time changes.
    pub fn read_mesh(&mut self) -> Option<Arc<MeshData>> {
        self.touch();
        let stamp = self.stamp();
        if let Some((cached_stamp, mesh)) = &self.mesh
            && *cached_stamp == stamp
        {
            return mesh.clone();
        }
        let mesh = self.decode_asset(stamp, "mesh", |decoders, path| {
            decoders.decode_mesh(path).map(Arc::new)
        });
        self.mesh = Some((stamp, mesh.clone()));
        mesh
    }

    fn decode_asset<T>(
        &self,
        stamp: FileStamp,
        kind: &str,
        decode: impl FnOnce(&dyn AssetDecoders, &Path) -> Result<T, String>,
    ) -> Option<T> {
        if stamp.is_none() {
            warn!(path = %self.path.display(), "file not found");
            return None;
        }
        let Some(decoders) = &self.decoders else {
            warn!(path = %self.path.display(), kind, "no decoders configured");
            return None;
        };
        match decode(decoders.as_ref(), &self.path) {
            Ok(artifact) => {
                debug!(path = %self.path.display(), kind, "read media file");
                Some(artifact)
            }
            Err(error) => {
                warn!(path = %self.path.display(), kind, %error, "error reading media file");
                None
            }
        }
    }

    /// The pair of frames bracketing `position` (seconds) for one consumer,
    /// plus the interpolation ratio between them.
    ///
    /// A small window of decoded frames rolls forward as positions advance;
    /// jumping backwards, or far enough forwards that the window's last
    /// frame is a keyframe behind the target, reseeks the stream.
    pub fn read_video_frames(
        &mut self,
        consumer: u64,
        position: f64,
        looping: bool,
    ) -> (f64, Option<Arc<VideoFrame>>, Option<Arc<VideoFrame>>) {
        self.touch();
        let stamp = self.stamp();
        let valid = matches!(self.videos.get(&consumer), Some(slot) if slot.stamp == stamp);
        if !valid {
            let stream = if stamp.is_none() {
                warn!(path = %self.path.display(), "file not found");
                None
            } else if let Some(decoders) = &self.decoders {
                match decoders.open_video(&self.path) {
                    Ok(stream) => {
                        debug!(path = %self.path.display(), "opened video file");
                        Some(stream)
                    }
                    Err(error) => {
                        warn!(path = %self.path.display(), %error, "error reading video file");
                        None
                    }
                }
            } else {
                warn!(path = %self.path.display(), "no decoders configured");
                None
            };
            self.videos.insert(
                consumer,
                VideoSlot {
                    stamp,
                    stream,
                    frames: Vec::new(),
                },
            );
        }
        let slot = self.videos.get_mut(&consumer).expect("video slot initialized");
        let Some(stream) = slot.stream.as_mut() else {
            return (0.0, None, None);
        };

        let ticks = (position / stream.time_base()) as i64;
        let timestamp = if looping {
            stream.start_time() + ticks.rem_euclid(stream.duration().max(1))
        } else {
            stream.start_time() + ticks.clamp(0, stream.duration())
        };

        let mut steps = 0;
        loop {
            if slot.frames.len() >= 2 {
                let Some(first) = slot.frames[0].clone().map(|frame| frame.pts) else {
                    break;
                };
                let last = slot.frames.last().expect("non-empty window").clone();
                let covered = timestamp >= first && last.as_ref().is_none_or(|frame| timestamp <= frame.pts);
                if covered {
                    break;
                }
                let second = slot.frames[1].as_ref().map_or(i64::MAX, |frame| frame.pts);
                let past_keyframe = last.is_some_and(|frame| frame.key_frame) && timestamp > second;
                if timestamp < first || past_keyframe {
                    slot.frames.clear();
                }
            }
            if slot.frames.is_empty() {
                trace!(path = %self.path.display(), timestamp, "seek video");
                stream.seek(timestamp);
            }
            if steps >= MAX_DECODE_STEPS {
                warn!(path = %self.path.display(), timestamp, "video decode budget exhausted");
                break;
            }
            steps += 1;
            match stream.decode_next() {
                Some(frame) => slot.frames.push(Some(Arc::new(frame))),
                None => {
                    trace!(path = %self.path.display(), "hit end of video");
                    slot.frames.push(None);
                }
            }
        }

        let mut current = None;
        let mut following = None;
        for frame in slot.frames.iter().rev() {
            match frame {
                Some(frame) if frame.pts <= timestamp => {
                    current = Some(frame.clone());
                    break;
                }
                other => following = other.clone(),
            }
        }
        let ratio = match (&current, &following) {
            (Some(current), Some(following)) if following.pts > current.pts => {
                (timestamp - current.pts) as f64 / (following.pts - current.pts) as f64
            }
            _ => 0.0,
        };
        (ratio, current, following)
    }
}

/// The process cache: one [`CachePath`] per resolved path, root-relative
/// resolution and TTL eviction. Owned by the scheduler, threaded by
/// reference into the subsystems that read files.
pub struct FileCache {
    root: PathBuf,
    entries: AHashMap<PathBuf, CachePath>,
    decoders: Option<Arc<dyn AssetDecoders>>,
}

impl FileCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("."),
            entries: AHashMap::new(),
            decoders: None,
        }
    }

    #[must_use]
    pub fn with_decoders(decoders: Arc<dyn AssetDecoders>) -> Self {
        Self {
            decoders: Some(decoders),
            ..Self::new()
        }
    }

    /// Sets the directory that relative paths resolve against. A file path
    /// selects its parent directory; a missing path resets to the current
    /// directory.
    pub fn set_root(&mut self, path: &Path) {
        self.root = if path.is_dir() {
            path.to_path_buf()
        } else if path.is_file() {
            path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        } else {
            PathBuf::from(".")
        };
    }

    /// The cache entry for `path`, creating it on first access.
    pub fn entry(&mut self, path: impl AsRef<Path>) -> &mut CachePath {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let key = joined.canonicalize().unwrap_or(joined);
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CachePath::new(key, self.decoders.clone()))
    }

    /// Evicts entries untouched for longer than `max_age`, releasing their
    /// resources. `Duration::ZERO` empties the cache.
    pub fn clean(&mut self, max_age: Duration) {
        let now = Instant::now();
        let expired: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.touched) >= max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(mut entry) = self.entries.remove(&key) {
                entry.cleanup();
                trace!(path = %key.display(), "discarded cache entry");
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One CSV record as a vector: numeric cells become numbers, mixed rows
/// degrade to symbols.
fn row_vector(record: &csv::StringRecord) -> Vector {
    let parts = record
        .iter()
        .map(|cell| {
            cell.trim()
                .parse::<f64>()
                .map_or_else(|_| Vector::from(cell), Vector::from)
        })
        .collect();
    Vector::compose(parts)
}

#[cfg(test)]
mod tests {
    use super::row_vector;
    use crate::values::Vector;

    #[test]
    fn csv_rows_parse_numbers_and_strings() {
        let numeric = csv::StringRecord::from(vec!["1", "2", "3"]);
        assert_eq!(row_vector(&numeric), Vector::from(vec![1.0, 2.0, 3.0]));
        let mixed = csv::StringRecord::from(vec!["label", "4", "a,b"]);
        let row = row_vector(&mixed);
        assert_eq!(row.len(), 3);
        assert!(row.numbers().is_none());
    }
}
