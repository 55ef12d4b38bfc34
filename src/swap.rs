//! Background paging of serialized items to disk.
//!
//! A [`SwapService`] runs one coordinator thread plus reader and writer workers. The
//! coordinator owns the job list and hands single files to idle workers, workers report back
//! over the same channel. Callers talk to their [`SwapJob`], whose queues are bounded: writes
//! and read notices block once `queue_bound` requests are pending.
//!
//! Items are identified by a key unique within their job and stored as
//! `work_dir/<prefix><key>`. A read is a read notice followed by [`SwapJob::read_item`], which
//! removes the file again.

use crate::common::SwapConfig;
use crate::error::{Error, Result, SwapError};
use hashbrown::{HashMap, HashSet};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Coordinator wake-up interval when no message arrives.
const IDLE_INTERVAL: Duration = Duration::from_millis(50);

type WriteFn = Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>;

#[derive(Default)]
struct JobState {
    writes: VecDeque<(String, WriteFn)>,
    reads: VecDeque<String>,
    /// Written or queued for writing and not read back yet.
    resident: HashSet<String>,
    on_disk: HashSet<String>,
    /// Read notices not consumed by `read_item` yet.
    noticed: HashSet<String>,
    completed: HashMap<String, std::result::Result<Vec<u8>, String>>,
    stopped: bool,
}

struct JobShared {
    id: usize,
    prefix: String,
    queue_bound: usize,
    state: Mutex<JobState>,
    changed: Condvar,
}

impl JobShared {
    fn finish_write(&self, key: String, result: Result<()>) {
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.on_disk.insert(key);
            }
            Err(e) => {
                error!("Swapping out {}{key} failed: {e}", self.prefix);
                state.completed.insert(key, Err(e.to_string()));
            }
        }
        self.changed.notify_all();
    }

    fn finish_read(&self, key: String, result: Result<Vec<u8>>) {
        let mut state = self.state.lock();
        state.on_disk.remove(&key);
        state
            .completed
            .insert(key, result.map_err(|e| e.to_string()));
        self.changed.notify_all();
    }

    fn next_write(&self) -> Option<(String, WriteFn)> {
        let mut state = self.state.lock();
        let item = state.writes.pop_front();
        if item.is_some() {
            self.changed.notify_all();
        }
        item
    }

    /// Next read notice, only once its item reached the disk. Notices of items whose write
    /// failed are dropped, `read_item` reports the failure.
    fn next_read(&self) -> Option<String> {
        let mut state = self.state.lock();
        let mut dropped = false;
        while let Some(front) = state.reads.front() {
            if !state.completed.contains_key(front) {
                break;
            }
            state.reads.pop_front();
            dropped = true;
        }
        let key = match state.reads.front() {
            Some(front) if state.on_disk.contains(front) => state.reads.pop_front(),
            _ => None,
        };
        if dropped || key.is_some() {
            self.changed.notify_all();
        }
        key
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
    }
}

enum Command {
    Register(Arc<JobShared>, Sender<()>),
    Remove(usize, Sender<()>),
    /// A job queued new work.
    Wake,
    WriteDone(Arc<JobShared>, String, Result<()>),
    ReadDone(Arc<JobShared>, String, Result<Vec<u8>>),
    Stop,
}

struct WriteTask {
    job: Arc<JobShared>,
    key: String,
    path: PathBuf,
    write: WriteFn,
}

struct ReadTask {
    job: Arc<JobShared>,
    key: String,
    path: PathBuf,
}

/// Handle to one registered job. Clones share the queues.
#[derive(Clone)]
pub struct SwapJob {
    shared: Arc<JobShared>,
    commands: Sender<Command>,
    warn_after: Duration,
    fail_after: Duration,
}

impl SwapJob {
    pub fn prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Blocks while the wait predicate holds. Fails with [`SwapError::Stopped`] once the
    /// service shuts down.
    fn wait_while<F>(&self, state: &mut MutexGuard<'_, JobState>, mut blocked: F) -> Result<()>
    where
        F: FnMut(&JobState) -> bool,
    {
        while blocked(&**state) {
            if state.stopped {
                return Err(SwapError::Stopped.into());
            }
            self.shared.changed.wait(state);
        }
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        self.commands
            .send(Command::Wake)
            .map_err(|_| SwapError::Stopped.into())
    }

    /// Queues `body` for writing. Blocks while `queue_bound` writes are pending.
    pub fn write_item<T>(&self, key: &str, body: T) -> Result<()>
    where
        T: Serialize + Send + 'static,
    {
        let bound = self.shared.queue_bound;
        let mut state = self.shared.state.lock();
        if state.resident.contains(key) {
            return Err(SwapError::AlreadySwappedOut(format!("{}{key}", self.prefix())).into());
        }
        self.wait_while(&mut state, |s| s.writes.len() >= bound)?;
        let write: WriteFn = Box::new(move |out: &mut dyn Write| {
            serde_json::to_writer(out, &body)?;
            Ok(())
        });
        state.resident.insert(key.to_string());
        state.writes.push_back((key.to_string(), write));
        drop(state);
        self.wake()
    }

    /// Requests `key` to be paged back in. Blocks while `queue_bound` notices are pending.
    pub fn issue_read_notice(&self, key: &str) -> Result<()> {
        let bound = self.shared.queue_bound;
        let mut state = self.shared.state.lock();
        if state.noticed.contains(key) {
            return Err(SwapError::DuplicateReadNotice(format!("{}{key}", self.prefix())).into());
        }
        self.wait_while(&mut state, |s| s.reads.len() >= bound)?;
        state.noticed.insert(key.to_string());
        state.reads.push_back(key.to_string());
        drop(state);
        self.wake()
    }

    /// Waits for a noticed item. Warns after `warn_after`, fails after `fail_after`.
    pub fn read_item<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let name = format!("{}{key}", self.prefix());
        let mut state = self.shared.state.lock();
        if !state.noticed.contains(key) {
            return Err(SwapError::MissingReadNotice(name).into());
        }
        let start = Instant::now();
        let mut warned = false;
        loop {
            if let Some(result) = state.completed.remove(key) {
                state.noticed.remove(key);
                state.resident.remove(key);
                state.reads.retain(|k| k != key);
                let bytes = result.map_err(|e| SwapError::Failed(name, e))?;
                return Ok(serde_json::from_slice(&bytes)?);
            }
            if state.stopped {
                return Err(SwapError::Stopped.into());
            }
            let deadline = if warned {
                start + self.fail_after
            } else {
                start + self.warn_after
            };
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
                && !state.completed.contains_key(key)
            {
                if warned {
                    error!("Waiting for {name} timed out");
                    state.noticed.remove(key);
                    state.reads.retain(|k| k != key);
                    return Err(SwapError::Timeout(name).into());
                }
                warn!("Waiting for {name} takes unusually long");
                warned = true;
            }
        }
    }
}

/// Reader and writer workers around a coordinator thread.
pub struct SwapService {
    config: SwapConfig,
    commands: Sender<Command>,
    receiver: Option<Receiver<Command>>,
    /// Jobs registered before the service started.
    initial_jobs: Vec<Arc<JobShared>>,
    next_job_id: usize,
    handles: Vec<JoinHandle<()>>,
}

impl SwapService {
    pub fn new(config: SwapConfig) -> Result<Self> {
        if config.queue_bound == 0 {
            return Err(Error::InvalidConfig("queue_bound must be positive".into()));
        }
        if config.read_threads == 0 || config.write_threads == 0 {
            return Err(Error::InvalidConfig(
                "at least one reader and one writer required".into(),
            ));
        }
        std::fs::create_dir_all(&config.work_dir).map_err(|source| Error::Open {
            path: config.work_dir.clone(),
            source,
        })?;
        let (commands, receiver) = mpsc::channel();
        Ok(Self {
            config,
            commands,
            receiver: Some(receiver),
            initial_jobs: Vec::new(),
            next_job_id: 0,
            handles: Vec::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.receiver.is_none()
    }

    pub fn register_job(&mut self, prefix: &str) -> Result<SwapJob> {
        let shared = Arc::new(JobShared {
            id: self.next_job_id,
            prefix: prefix.to_string(),
            queue_bound: self.config.queue_bound,
            state: Mutex::new(JobState::default()),
            changed: Condvar::new(),
        });
        self.next_job_id += 1;
        if self.is_running() {
            let (reply, done) = mpsc::channel();
            self.commands
                .send(Command::Register(shared.clone(), reply))
                .map_err(|_| SwapError::Stopped)?;
            done.recv().map_err(|_| SwapError::Stopped)?;
        } else {
            self.initial_jobs.push(shared.clone());
        }
        Ok(SwapJob {
            shared,
            commands: self.commands.clone(),
            warn_after: self.config.warn_after,
            fail_after: self.config.fail_after,
        })
    }

    pub fn remove_job(&mut self, job: &SwapJob) -> Result<()> {
        let id = job.shared.id;
        if !self.is_running() {
            let before = self.initial_jobs.len();
            self.initial_jobs.retain(|j| j.id != id);
            if self.initial_jobs.len() == before {
                return Err(SwapError::UnknownJob(job.prefix().to_string()).into());
            }
            return Ok(());
        }
        let (reply, done) = mpsc::channel();
        self.commands
            .send(Command::Remove(id, reply))
            .map_err(|_| SwapError::Stopped)?;
        done.recv().map_err(|_| SwapError::Stopped)?;
        Ok(())
    }

    /// Spawns the coordinator and the workers. No-op if already running.
    pub fn start(&mut self) -> Result<()> {
        let Some(receiver) = self.receiver.take() else {
            return Ok(());
        };
        info!(
            "Starting swap service with {} readers and {} writers in {}",
            self.config.read_threads,
            self.config.write_threads,
            self.config.work_dir.display()
        );
        let (write_tx, write_rx) = mpsc::channel::<WriteTask>();
        let (read_tx, read_rx) = mpsc::channel::<ReadTask>();
        let write_rx = Arc::new(Mutex::new(write_rx));
        let read_rx = Arc::new(Mutex::new(read_rx));

        for i in 0..self.config.write_threads {
            let tasks = write_rx.clone();
            let reports = self.commands.clone();
            self.handles.push(
                thread::Builder::new()
                    .name(format!("swap-writer-{i}"))
                    .spawn(move || write_worker(&tasks, &reports))?,
            );
        }
        for i in 0..self.config.read_threads {
            let tasks = read_rx.clone();
            let reports = self.commands.clone();
            self.handles.push(
                thread::Builder::new()
                    .name(format!("swap-reader-{i}"))
                    .spawn(move || read_worker(&tasks, &reports))?,
            );
        }

        let coordinator = Coordinator {
            work_dir: self.config.work_dir.clone(),
            jobs: std::mem::take(&mut self.initial_jobs),
            idle_writers: self.config.write_threads,
            idle_readers: self.config.read_threads,
            write_cursor: 0,
            read_cursor: 0,
            write_tx,
            read_tx,
        };
        self.handles.push(
            thread::Builder::new()
                .name("swap-coordinator".into())
                .spawn(move || coordinator.run(&receiver))?,
        );
        Ok(())
    }
}

impl Drop for SwapService {
    fn drop(&mut self) {
        if !self.is_running() {
            self.initial_jobs.iter().for_each(|j| j.stop());
            return;
        }
        let _ = self.commands.send(Command::Stop);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Swap thread panicked");
            }
        }
    }
}

struct Coordinator {
    work_dir: PathBuf,
    jobs: Vec<Arc<JobShared>>,
    idle_writers: usize,
    idle_readers: usize,
    write_cursor: usize,
    read_cursor: usize,
    write_tx: Sender<WriteTask>,
    read_tx: Sender<ReadTask>,
}

impl Coordinator {
    fn run(mut self, commands: &Receiver<Command>) {
        loop {
            match commands.recv_timeout(IDLE_INTERVAL) {
                Ok(Command::Register(job, reply)) => {
                    debug!("Registering swap job {}", job.prefix);
                    self.jobs.push(job);
                    let _ = reply.send(());
                }
                Ok(Command::Remove(id, reply)) => {
                    self.jobs.retain(|j| j.id != id);
                    let _ = reply.send(());
                }
                Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(Command::WriteDone(job, key, result)) => {
                    self.idle_writers += 1;
                    job.finish_write(key, result);
                }
                Ok(Command::ReadDone(job, key, result)) => {
                    self.idle_readers += 1;
                    job.finish_read(key, result);
                }
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            }
            self.dispatch();
        }
        self.jobs.iter().for_each(|j| j.stop());
        debug!("Swap coordinator stopped");
        // Dropping the task senders ends the workers.
    }

    /// Hands pending work to idle workers, visiting jobs round robin.
    fn dispatch(&mut self) {
        let n = self.jobs.len();
        if n == 0 {
            return;
        }
        let mut visited = 0;
        while self.idle_writers > 0 && visited < n {
            let job = &self.jobs[self.write_cursor % n];
            self.write_cursor = (self.write_cursor + 1) % n;
            match job.next_write() {
                Some((key, write)) => {
                    let task = WriteTask {
                        job: job.clone(),
                        path: self.work_dir.join(format!("{}{key}", job.prefix)),
                        key,
                        write,
                    };
                    if self.write_tx.send(task).is_err() {
                        return;
                    }
                    self.idle_writers -= 1;
                    visited = 0;
                }
                None => visited += 1,
            }
        }
        visited = 0;
        while self.idle_readers > 0 && visited < n {
            let job = &self.jobs[self.read_cursor % n];
            self.read_cursor = (self.read_cursor + 1) % n;
            match job.next_read() {
                Some(key) => {
                    let task = ReadTask {
                        job: job.clone(),
                        path: self.work_dir.join(format!("{}{key}", job.prefix)),
                        key,
                    };
                    if self.read_tx.send(task).is_err() {
                        return;
                    }
                    self.idle_readers -= 1;
                    visited = 0;
                }
                None => visited += 1,
            }
        }
    }
}

fn write_worker(tasks: &Mutex<Receiver<WriteTask>>, reports: &Sender<Command>) {
    loop {
        // NOTE: The lock is only held while waiting for the next task.
        let task = tasks.lock().recv();
        let Ok(task) = task else {
            break;
        };
        let result = write_file(&task.path, task.write);
        if reports
            .send(Command::WriteDone(task.job, task.key, result))
            .is_err()
        {
            break;
        }
    }
}

fn write_file(path: &Path, write: WriteFn) -> Result<()> {
    let file = File::create(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    write(&mut out)?;
    out.flush()?;
    Ok(())
}

fn read_worker(tasks: &Mutex<Receiver<ReadTask>>, reports: &Sender<Command>) {
    loop {
        let task = tasks.lock().recv();
        let Ok(task) = task else {
            break;
        };
        let result = read_file(&task.path);
        if reports
            .send(Command::ReadDone(task.job, task.key, result))
            .is_err()
        {
            break;
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut bytes = Vec::new();
    BufReader::new(file).read_to_end(&mut bytes)?;
    std::fs::remove_file(path)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(name: &str) -> SwapConfig {
        SwapConfig {
            work_dir: std::env::temp_dir()
                .join(format!("video-segment-swap-{}-{name}", std::process::id())),
            ..Default::default()
        }
    }

    #[test]
    fn items_round_trip_through_disk() {
        init();
        let mut service = SwapService::new(config("round-trip")).unwrap();
        service.start().unwrap();
        assert!(service.is_running());
        let levels = service.register_job("levels_").unwrap();
        let frames = service.register_job("frames_").unwrap();

        for i in 0..5u32 {
            levels.write_item(&i.to_string(), vec![i; 3]).unwrap();
            frames.write_item(&i.to_string(), format!("frame {i}")).unwrap();
        }
        for i in (0..5u32).rev() {
            levels.issue_read_notice(&i.to_string()).unwrap();
            frames.issue_read_notice(&i.to_string()).unwrap();
        }
        for i in 0..5u32 {
            assert_eq!(levels.read_item::<Vec<u32>>(&i.to_string()).unwrap(), vec![i; 3]);
            assert_eq!(frames.read_item::<String>(&i.to_string()).unwrap(), format!("frame {i}"));
        }
        // Read back items may be written again.
        levels.write_item("0", vec![7u32]).unwrap();
        levels.issue_read_notice("0").unwrap();
        assert_eq!(levels.read_item::<Vec<u32>>("0").unwrap(), vec![7]);
        service.remove_job(&frames).unwrap();
    }

    #[test]
    fn misuse_is_reported() {
        let mut service = SwapService::new(config("misuse")).unwrap();
        let job = service.register_job("job_").unwrap();
        job.write_item("a", 1u8).unwrap();
        assert!(matches!(
            job.write_item("a", 2u8),
            Err(Error::Swap(SwapError::AlreadySwappedOut(_)))
        ));
        assert!(matches!(
            job.read_item::<u8>("a"),
            Err(Error::Swap(SwapError::MissingReadNotice(_)))
        ));
        job.issue_read_notice("a").unwrap();
        assert!(matches!(
            job.issue_read_notice("a"),
            Err(Error::Swap(SwapError::DuplicateReadNotice(_)))
        ));

        let other = service.register_job("other_").unwrap();
        service.remove_job(&other).unwrap();
        assert!(service.remove_job(&other).is_err());

        let zero = SwapConfig {
            queue_bound: 0,
            ..config("misuse")
        };
        assert!(SwapService::new(zero).is_err());
    }

    #[test]
    fn reads_time_out() {
        init();
        let mut service = SwapService::new(SwapConfig {
            warn_after: Duration::from_millis(10),
            fail_after: Duration::from_millis(50),
            ..config("timeout")
        })
        .unwrap();
        service.start().unwrap();
        let job = service.register_job("job_").unwrap();
        // Never written, so the notice is never served.
        job.issue_read_notice("missing").unwrap();
        assert!(matches!(
            job.read_item::<u8>("missing"),
            Err(Error::Swap(SwapError::Timeout(_)))
        ));
    }

    #[test]
    fn failed_write_does_not_stall_later_reads() {
        init();
        let mut service = SwapService::new(config("failed-write")).unwrap();
        service.start().unwrap();
        let job = service.register_job("job_").unwrap();
        // JSON maps need string keys.
        let unserializable: HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        job.write_item("bad", unserializable).unwrap();
        job.write_item("good", 7u8).unwrap();
        job.issue_read_notice("bad").unwrap();
        job.issue_read_notice("good").unwrap();
        assert!(matches!(
            job.read_item::<HashMap<(u8, u8), u8>>("bad"),
            Err(Error::Swap(SwapError::Failed(_, _)))
        ));
        assert_eq!(job.read_item::<u8>("good").unwrap(), 7);
    }

    #[test]
    fn failed_read_is_reported() {
        init();
        let cfg = config("failed-read");
        let path = cfg.work_dir.join("job_lost");
        let mut service = SwapService::new(cfg).unwrap();
        service.start().unwrap();
        let job = service.register_job("job_").unwrap();
        job.write_item("lost", 1u8).unwrap();
        let start = Instant::now();
        while !path.exists() {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(5));
        }
        // Give the coordinator time to record the finished write.
        thread::sleep(Duration::from_millis(100));
        std::fs::remove_file(&path).unwrap();

        job.write_item("kept", 2u8).unwrap();
        job.issue_read_notice("lost").unwrap();
        job.issue_read_notice("kept").unwrap();
        assert!(matches!(
            job.read_item::<u8>("lost"),
            Err(Error::Swap(SwapError::Failed(_, _)))
        ));
        assert_eq!(job.read_item::<u8>("kept").unwrap(), 2);
    }

    #[test]
    fn job_recovers_after_timeout() {
        init();
        let mut service = SwapService::new(SwapConfig {
            warn_after: Duration::from_millis(10),
            fail_after: Duration::from_millis(50),
            ..config("recover")
        })
        .unwrap();
        service.start().unwrap();
        let job = service.register_job("job_").unwrap();
        job.issue_read_notice("missing").unwrap();
        assert!(job.read_item::<u8>("missing").is_err());

        job.write_item("present", 5u8).unwrap();
        job.issue_read_notice("present").unwrap();
        assert_eq!(job.read_item::<u8>("present").unwrap(), 5);
        // The timed out notice may be issued again.
        job.issue_read_notice("missing").unwrap();
    }

    #[test]
    fn queueing_after_shutdown_fails() {
        let mut service = SwapService::new(config("shutdown")).unwrap();
        let job = service.register_job("job_").unwrap();
        drop(service);
        assert!(matches!(
            job.write_item("0", 0u8),
            Err(Error::Swap(SwapError::Stopped))
        ));
    }

    #[test]
    fn writes_block_on_full_queue() {
        init();
        let mut service = SwapService::new(config("backpressure")).unwrap();
        let job = service.register_job("job_").unwrap();
        for i in 0..20u32 {
            job.write_item(&i.to_string(), i).unwrap();
        }

        let (done_tx, done_rx) = mpsc::channel();
        let blocked = job.clone();
        let writer = thread::spawn(move || {
            blocked.write_item("20", 20u32).unwrap();
            done_tx.send(()).unwrap();
        });
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

        service.start().unwrap();
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        writer.join().unwrap();

        for i in 0..21u32 {
            job.issue_read_notice(&i.to_string()).unwrap();
        }
        for i in 0..21u32 {
            assert_eq!(job.read_item::<u32>(&i.to_string()).unwrap(), i);
        }
    }

    #[test]
    fn dropping_the_service_releases_blocked_callers() {
        let mut service = SwapService::new(SwapConfig {
            queue_bound: 1,
            ..config("drop")
        })
        .unwrap();
        let job = service.register_job("job_").unwrap();
        job.write_item("0", 0u8).unwrap();
        let blocked = job.clone();
        let writer = thread::spawn(move || blocked.write_item("1", 1u8));
        thread::sleep(Duration::from_millis(50));
        drop(service);
        assert!(matches!(
            writer.join().unwrap(),
            Err(Error::Swap(SwapError::Stopped))
        ));
    }
}
