//! Byte providers over local storage and the owned buffers they hand out.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::errors::{Error, Result};

/// An owned byte buffer covering the absolute range `[start, stop)` of a file.
#[derive(Clone, Debug)]
pub struct Chunk {
    start: u64,
    stop: u64,
    data: Arc<Vec<u8>>,
}

impl Chunk {
    /// Wraps already-materialized bytes, e.g. a decompressed record. The
    /// chunk's coordinate system starts at zero.
    pub fn wrap(data: Vec<u8>) -> Self {
        let stop = data.len() as u64;
        Chunk {
            start: 0,
            stop,
            data: Arc::new(data),
        }
    }

    pub fn with_range(start: u64, data: Vec<u8>) -> Self {
        let stop = start + data.len() as u64;
        Chunk {
            start,
            stop,
            data: Arc::new(data),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn stop(&self) -> u64 {
        self.stop
    }

    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    pub fn contains(&self, start: u64, stop: u64) -> bool {
        self.start <= start && stop <= self.stop
    }

    /// Borrows the absolute range `[start, stop)`.
    pub fn get(&self, start: u64, stop: u64, path: &Path) -> Result<&[u8]> {
        if !self.contains(start, stop) || stop < start {
            return Err(Error::format(
                path,
                format!(
                    "attempting to get bytes {start}:{stop} from a chunk covering {}:{}",
                    self.start, self.stop
                ),
            ));
        }
        let a = (start - self.start) as usize;
        let b = (stop - self.start) as usize;
        Ok(&self.data[a..b])
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }
}

/// A random-access byte provider.
///
/// Implementations are callable from multiple threads. `chunk` may return a
/// wider range than requested (the whole buffer for in-memory sources);
/// callers address bytes through the chunk's absolute coordinates, so extra
/// coverage is harmless.
pub trait Source: Send + Sync {
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk>;

    /// Requests several ranges. Each completed chunk is also published to
    /// `sink` in completion order; the returned vector preserves request
    /// order. Callers that depend on ordering must use the return value.
    fn chunks(
        &self,
        ranges: &[(u64, u64)],
        sink: Option<&(dyn Fn(Chunk) + Sync)>,
    ) -> Result<Vec<Chunk>> {
        let mut out = Vec::with_capacity(ranges.len());
        for &(start, stop) in ranges {
            let chunk = self.chunk(start, stop)?;
            if let Some(sink) = sink {
                sink(chunk.clone());
            }
            out.push(chunk);
        }
        Ok(out)
    }

    fn num_bytes(&self) -> u64;

    fn path(&self) -> &Path;

    /// Idempotent. In-flight reads on other threads fail once the source is
    /// closed.
    fn close(&self);

    fn closed(&self) -> bool;
}

/// A source over caller-supplied bytes.
pub struct MemSource {
    path: PathBuf,
    data: Arc<Vec<u8>>,
    closed: AtomicBool,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        MemSource {
            path: PathBuf::from("<memory>"),
            data: Arc::new(data),
            closed: AtomicBool::new(false),
        }
    }
}

impl Source for MemSource {
    fn chunk(&self, _start: u64, _stop: u64) -> Result<Chunk> {
        if self.closed() {
            return Err(Error::io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::Other, "source is closed"),
            ));
        }
        Ok(Chunk {
            start: 0,
            stop: self.data.len() as u64,
            data: Arc::clone(&self.data),
        })
    }

    fn num_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A memory-mapped file. Reads are lock-free; every chunk copies out of the
/// map so it can outlive the source.
pub struct MmapSource {
    path: PathBuf,
    map: memmap2::Mmap,
    closed: AtomicBool,
}

impl MmapSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        // Safety: the map is never resized and chunks copy out of it.
        let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| Error::io(&path, e))?;
        Ok(MmapSource {
            path,
            map,
            closed: AtomicBool::new(false),
        })
    }
}

impl Source for MmapSource {
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        if self.closed() {
            return Err(Error::io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::Other, "source is closed"),
            ));
        }
        let stop = stop.min(self.map.len() as u64);
        if start > stop {
            return Err(Error::format(
                &self.path,
                format!("chunk range {start}:{stop} is beyond the end of the file"),
            ));
        }
        trace!(start, stop, path = ?self.path, "mmap chunk");
        Ok(Chunk::with_range(
            start,
            self.map[start as usize..stop as usize].to_vec(),
        ))
    }

    fn num_bytes(&self) -> u64 {
        self.map.len() as u64
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A plain file source holding a small pool of independent handles, one per
/// worker, so parallel `chunk` calls do not serialize on a single seek
/// position.
pub struct FileSource {
    path: PathBuf,
    handles: Vec<Mutex<File>>,
    next: AtomicUsize,
    num_bytes: u64,
    closed: AtomicBool,
}

impl FileSource {
    pub fn open(path: impl Into<PathBuf>, num_workers: usize) -> Result<Self> {
        let path = path.into();
        let num_workers = num_workers.max(1);
        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            handles.push(Mutex::new(
                File::open(&path).map_err(|e| Error::io(&path, e))?,
            ));
        }
        let num_bytes = handles[0]
            .lock()
            .unwrap()
            .metadata()
            .map_err(|e| Error::io(&path, e))?
            .len();
        Ok(FileSource {
            path,
            handles,
            next: AtomicUsize::new(0),
            num_bytes,
            closed: AtomicBool::new(false),
        })
    }

    fn read_range(&self, start: u64, stop: u64) -> Result<Chunk> {
        if self.closed() {
            return Err(Error::io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::Other, "source is closed"),
            ));
        }
        let stop = stop.min(self.num_bytes);
        if start > stop {
            return Err(Error::format(
                &self.path,
                format!("chunk range {start}:{stop} is beyond the end of the file"),
            ));
        }
        let which = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        let mut file = self.handles[which].lock().unwrap();
        let mut data = vec![0u8; (stop - start) as usize];
        file.seek(SeekFrom::Start(start))
            .and_then(|_| file.read_exact(&mut data))
            .map_err(|e| Error::io(&self.path, e))?;
        trace!(start, stop, worker = which, path = ?self.path, "file chunk");
        Ok(Chunk::with_range(start, data))
    }
}

impl Source for FileSource {
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        self.read_range(start, stop)
    }

    fn chunks(
        &self,
        ranges: &[(u64, u64)],
        sink: Option<&(dyn Fn(Chunk) + Sync)>,
    ) -> Result<Vec<Chunk>> {
        if self.handles.len() == 1 || ranges.len() <= 1 {
            let mut out = Vec::with_capacity(ranges.len());
            for &(start, stop) in ranges {
                let chunk = self.read_range(start, stop)?;
                if let Some(sink) = sink {
                    sink(chunk.clone());
                }
                out.push(chunk);
            }
            return Ok(out);
        }

        let num_threads = self.handles.len().min(ranges.len());
        let mut per_thread: Vec<Vec<(usize, Result<Chunk>)>> = Vec::new();
        std::thread::scope(|scope| {
            let mut join = Vec::with_capacity(num_threads);
            for offset in 0..num_threads {
                join.push(scope.spawn(move || {
                    let mut results = Vec::new();
                    let mut i = offset;
                    while i < ranges.len() {
                        let (start, stop) = ranges[i];
                        let result = self.read_range(start, stop);
                        if let (Ok(chunk), Some(sink)) = (&result, sink) {
                            sink(chunk.clone());
                        }
                        results.push((i, result));
                        i += num_threads;
                    }
                    results
                }));
            }
            for handle in join {
                per_thread.push(handle.join().expect("reader thread panicked"));
            }
        });

        let mut out: Vec<Option<Result<Chunk>>> = Vec::new();
        out.resize_with(ranges.len(), || None);
        for (index, result) in per_thread.into_iter().flatten() {
            out[index] = Some(result);
        }
        out.into_iter()
            .map(|slot| slot.expect("every range produced a result"))
            .collect()
    }

    fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Where decompression work runs. The default executor runs jobs inline on
/// the calling thread; callers with many records to decompress can supply a
/// pool.
pub trait Executor: Send + Sync {
    fn submit(&self, job: Box<dyn FnOnce() + Send>);

    fn shutdown(&self) {}
}

/// Runs every job on the calling thread.
pub struct TrivialExecutor;

impl Executor for TrivialExecutor {
    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_source_returns_whole_buffer() {
        let source = MemSource::new(vec![1, 2, 3, 4, 5]);
        let chunk = source.chunk(1, 3).unwrap();
        assert!(chunk.contains(0, 5));
        assert_eq!(
            chunk.get(1, 3, Path::new("<memory>")).unwrap(),
            &[2u8, 3u8][..]
        );
    }

    #[test]
    fn closed_source_fails() {
        let source = MemSource::new(vec![0; 16]);
        source.close();
        source.close();
        assert!(source.chunk(0, 4).is_err());
    }

    #[test]
    fn chunks_preserve_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, (0u8..=255).collect::<Vec<_>>()).unwrap();
        let source = FileSource::open(&path, 3).unwrap();
        let chunks = source
            .chunks(&[(10, 12), (0, 4), (250, 256)], None)
            .unwrap();
        assert_eq!(chunks[0].get(10, 12, &path).unwrap(), &[10, 11][..]);
        assert_eq!(chunks[1].get(0, 4, &path).unwrap(), &[0, 1, 2, 3][..]);
        assert_eq!(chunks[2].get(250, 252, &path).unwrap(), &[250, 251][..]);
    }
}
