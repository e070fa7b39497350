//! The processing server: a pool of submitter consumers feeds one
//! request channel; the serve loop admits queued submissions while
//! capacity lasts and hands each one to a handler/worker pair. `busy`
//! counts live workers and only the completion signal decrements it, so
//! the pool bound holds no matter how submissions end.

use crate::error::ProcError;
use crate::mq;
use crate::request::{Kind, Request};
use crate::tool::ToolProvider;
use crate::worker::{FileWorker, WorkerMsg};
use broker::{Connection, MessageHandler};
use db::{FileKind, Oid, Store};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default worker-pool bound: one core is left free for coordination
/// and I/O.
pub fn max_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

pub struct Server {
    uri: String,
    max_procs: usize,
    store: Arc<dyn Store>,
    provider: Arc<dyn ToolProvider>,
    request_tx: mpsc::Sender<Request>,
    request_rx: mpsc::Receiver<Request>,
    processed_tx: mpsc::Sender<()>,
    processed_rx: mpsc::Receiver<()>,
    submitter: MessageHandler,
    redoer: MessageHandler,
}

pub struct ServerHandle {
    processed_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Server {
    pub fn new(
        uri: &str,
        max_procs: usize,
        store: Arc<dyn Store>,
        provider: Arc<dyn ToolProvider>,
    ) -> Result<Server, ProcError> {
        let conn = Connection::open(uri)?;
        let (request_tx, request_rx) = mpsc::channel(64);
        let (processed_tx, processed_rx) = mpsc::channel(16);
        let submitter = mq::new_submitter(&conn, request_tx.clone())?;
        let redoer = mq::new_redoer(&conn, request_tx.clone())?;
        Ok(Server {
            uri: uri.to_string(),
            max_procs: max_procs.max(1),
            store,
            provider,
            request_tx,
            request_rx,
            processed_tx,
            processed_rx,
            submitter,
            redoer,
        })
    }

    /// Spawns the serve loop and returns its shutdown handle.
    pub fn serve(self) -> ServerHandle {
        let processed_tx = self.processed_tx.clone();
        let task = tokio::spawn(self.run());
        ServerHandle { processed_tx, task }
    }

    async fn run(self) {
        let Server {
            uri,
            max_procs,
            store,
            provider,
            request_tx,
            mut request_rx,
            processed_tx,
            mut processed_rx,
            submitter,
            redoer,
        } = self;
        let mut handlers: HashMap<Oid, Handler> = HashMap::new();
        let mut sub_queue: VecDeque<Oid> = VecDeque::new();
        // Goes negative exactly once: when shutdown's extra completion
        // signal arrives after the last worker finished.
        let mut busy: i64 = 0;
        loop {
            if busy >= 0 && (busy as usize) < max_procs && !sub_queue.is_empty() {
                let sid = sub_queue.pop_front().expect("queue checked non-empty");
                if let Some(h) = handlers.get_mut(&sid) {
                    h.started = true;
                    let spawn = h.take_spawn_state();
                    let done = h.done;
                    tokio::spawn(handler_run(
                        sid,
                        spawn,
                        done,
                        store.clone(),
                        provider.clone(),
                        uri.clone(),
                        processed_tx.clone(),
                    ));
                    if done {
                        handlers.remove(&sid);
                    }
                    busy += 1;
                }
            } else if busy < 0 {
                break;
            }
            tokio::select! {
                Some(r) = request_rx.recv() => match r.kind {
                    Kind::SUBMISSION_START => {
                        if handlers.contains_key(&r.sub_id) {
                            log::warn!("submission {} already started", r.sub_id);
                        } else {
                            match Handler::new(&uri, r.sub_id, request_tx.clone()) {
                                Ok(h) => {
                                    sub_queue.push_back(r.sub_id);
                                    handlers.insert(r.sub_id, h);
                                    if let Err(e) = mq::change_status(&uri, &r) {
                                        log::warn!("status change failed: {}", e);
                                    }
                                }
                                Err(e) => {
                                    log::error!("cannot set up submission {}: {}", r.sub_id, e)
                                }
                            }
                        }
                    }
                    Kind::SUBMISSION_STOP => match handlers.get_mut(&r.sub_id) {
                        None => log::warn!("no submission {} found to end", r.sub_id),
                        Some(h) => {
                            h.set_done().await;
                            if h.started {
                                handlers.remove(&r.sub_id);
                            }
                        }
                    },
                    Kind::FILE_ADD => match handlers.get_mut(&r.sub_id) {
                        None => log::warn!(
                            "no submission {} found for file {}",
                            r.sub_id,
                            r.file_id
                        ),
                        Some(h) => match store.file(&r.file_id).await {
                            Err(e) => log::warn!("file {} skipped: {}", r.file_id, e),
                            Ok(f) => {
                                // Tracked before the handler sees it, so its
                                // removal can never be reported first.
                                if let Err(e) = mq::change_status(&uri, &r) {
                                    log::warn!("status change failed: {}", e);
                                }
                                if !h.add_file(r.file_id, f.kind).await {
                                    let remove = Request::remove_file(r.sub_id, r.file_id);
                                    if let Err(e) = mq::change_status(&uri, &remove) {
                                        log::warn!("status change failed: {}", e);
                                    }
                                }
                            }
                        },
                    },
                    _ => log::warn!("unsupported request type {}", r.kind),
                },
                Some(_) = processed_rx.recv() => busy -= 1,
                else => break,
            }
        }
        if let Err(e) = submitter.shutdown().await {
            log::error!("submitter shutdown failed: {}", e);
        }
        if let Err(e) = redoer.shutdown().await {
            log::error!("redoer shutdown failed: {}", e);
        }
    }
}

impl ServerHandle {
    /// Signals the serve loop to exit once all in-flight submissions
    /// have completed, and waits for it.
    pub async fn shutdown(self) -> Result<(), ProcError> {
        self.processed_tx
            .send(())
            .await
            .map_err(|_| ProcError::ChannelClosed)?;
        self.task.await.map_err(|_| ProcError::ChannelClosed)
    }
}

/// Per-submission bookkeeping on the server side. Before the submission
/// is admitted, file ids collect in the queues; once its task runs, the
/// live channels carry them instead.
pub struct Handler {
    pub sub_id: Oid,
    pub started: bool,
    pub done: bool,
    file_queue: VecDeque<Oid>,
    test_queue: VecDeque<Oid>,
    file_tx: mpsc::Sender<Oid>,
    test_tx: mpsc::Sender<Oid>,
    done_tx: mpsc::Sender<()>,
    spawn: Option<SpawnState>,
}

/// Everything the spawned handler task takes ownership of: the receive
/// halves, the pre-start queues and the submission's filer consumer.
struct SpawnState {
    file_rx: mpsc::Receiver<Oid>,
    test_rx: mpsc::Receiver<Oid>,
    done_rx: mpsc::Receiver<()>,
    file_queue: VecDeque<Oid>,
    test_queue: VecDeque<Oid>,
    filer: Option<MessageHandler>,
}

impl Handler {
    fn new(uri: &str, sub_id: Oid, request_tx: mpsc::Sender<Request>) -> Result<Handler, ProcError> {
        let conn = Connection::open(uri)?;
        let filer = mq::new_filer(&conn, request_tx, &sub_id)?;
        let (file_tx, file_rx) = mpsc::channel(1);
        let (test_tx, test_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        Ok(Handler {
            sub_id,
            started: false,
            done: false,
            file_queue: VecDeque::new(),
            test_queue: VecDeque::new(),
            file_tx,
            test_tx,
            done_tx,
            spawn: Some(SpawnState {
                file_rx,
                test_rx,
                done_rx,
                file_queue: VecDeque::new(),
                test_queue: VecDeque::new(),
                filer: Some(filer),
            }),
        })
    }

    fn take_spawn_state(&mut self) -> SpawnState {
        let mut spawn = self.spawn.take().expect("submission spawned twice");
        spawn.file_queue = std::mem::take(&mut self.file_queue);
        spawn.test_queue = std::mem::take(&mut self.test_queue);
        spawn
    }

    /// Sources and archives share a lane; tests get their own so they
    /// can be held back until the code has been compiled and stored.
    /// Returns false when the submission's task is no longer accepting
    /// files (an aborted worker).
    async fn add_file(&mut self, fid: Oid, kind: FileKind) -> bool {
        match kind {
            FileKind::Src | FileKind::Archive => {
                if self.started {
                    self.file_tx.send(fid).await.is_ok()
                } else {
                    self.file_queue.push_back(fid);
                    true
                }
            }
            FileKind::Test => {
                if self.started {
                    self.test_tx.send(fid).await.is_ok()
                } else {
                    self.test_queue.push_back(fid);
                    true
                }
            }
            FileKind::Launch => {
                log::warn!("launch file {} ignored", fid);
                false
            }
        }
    }

    async fn set_done(&mut self) {
        if self.started {
            let _ = self.done_tx.send(()).await;
        } else {
            self.done = true;
        }
    }
}

/// Sources and archives drain first; tests only once no more sources
/// can arrive.
fn next_file(file_queue: &mut VecDeque<Oid>, test_queue: &mut VecDeque<Oid>, done: bool) -> Option<Oid> {
    if let Some(fid) = file_queue.pop_front() {
        return Some(fid);
    }
    if done { test_queue.pop_front() } else { None }
}

async fn handler_run(
    sub_id: Oid,
    spawn: SpawnState,
    done: bool,
    store: Arc<dyn Store>,
    provider: Arc<dyn ToolProvider>,
    uri: String,
    processed_tx: mpsc::Sender<()>,
) {
    let SpawnState {
        mut file_rx,
        mut test_rx,
        mut done_rx,
        mut file_queue,
        mut test_queue,
        filer,
    } = spawn;
    let mut done = done;
    match FileWorker::new(store.clone(), provider, &uri, &sub_id).await {
        // A worker that cannot even be constructed aborts the whole
        // submission; the queued files are untracked again so the stop
        // report below leaves the tracker clean, and the completion
        // signal keeps the pool count correct.
        Err(e) => {
            log::error!("cannot process submission {}: {}", sub_id, e);
            for fid in file_queue.drain(..).chain(test_queue.drain(..)) {
                if let Err(e) = mq::change_status(&uri, &Request::remove_file(sub_id, fid)) {
                    log::warn!("status change failed: {}", e);
                }
            }
        }
        Ok(worker) => {
            let (work_tx, work_rx) = mpsc::channel(1);
            let (finished_tx, mut finished_rx) = mpsc::channel(1);
            let worker_task = tokio::spawn(worker.start(work_rx, finished_tx));
            let mut busy = false;
            loop {
                if !busy {
                    if let Some(fid) = next_file(&mut file_queue, &mut test_queue, done) {
                        if work_tx.send(WorkerMsg::Process(fid)).await.is_err() {
                            break;
                        }
                        busy = true;
                    } else if done {
                        let _ = work_tx.send(WorkerMsg::Stop).await;
                        if let Err(e) = worker_task.await {
                            log::error!("worker for {} panicked: {}", sub_id, e);
                        }
                        break;
                    }
                }
                tokio::select! {
                    Some(fid) = file_rx.recv() => file_queue.push_back(fid),
                    Some(fid) = test_rx.recv() => test_queue.push_back(fid),
                    Some(fid) = finished_rx.recv() => {
                        if let Err(e) =
                            mq::change_status(&uri, &Request::remove_file(sub_id, fid))
                        {
                            log::warn!("status change failed: {}", e);
                        }
                        busy = false;
                    }
                    Some(_) = done_rx.recv() => done = true,
                    else => break,
                }
            }
        }
    }
    if let Err(e) = mq::change_status(&uri, &Request::stop_submission(sub_id)) {
        log::warn!("could not report stop for {}: {}", sub_id, e);
    }
    if let Some(filer) = filer {
        if let Err(e) = filer.shutdown().await {
            log::warn!("filer shutdown for {} failed: {}", sub_id, e);
        }
    }
    let _ = processed_tx.send(()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_drain_before_tests() {
        let mut files = VecDeque::new();
        let mut tests = VecDeque::new();
        let (t1, s1, t2, s2) = (Oid::new(), Oid::new(), Oid::new(), Oid::new());
        // Interleaved arrival: test, source, test, source.
        tests.push_back(t1);
        files.push_back(s1);
        tests.push_back(t2);
        files.push_back(s2);

        assert_eq!(next_file(&mut files, &mut tests, true), Some(s1));
        assert_eq!(next_file(&mut files, &mut tests, true), Some(s2));
        assert_eq!(next_file(&mut files, &mut tests, true), Some(t1));
        assert_eq!(next_file(&mut files, &mut tests, true), Some(t2));
        assert_eq!(next_file(&mut files, &mut tests, true), None);
    }

    #[test]
    fn test_tests_wait_for_the_stop_signal() {
        let mut files = VecDeque::new();
        let mut tests = VecDeque::new();
        tests.push_back(Oid::new());
        // Not done yet: a source could still arrive, so tests hold.
        assert_eq!(next_file(&mut files, &mut tests, false), None);
        assert_eq!(tests.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_queues_before_start_and_flags_done() {
        let uri = "local://handler-unit";
        let (request_tx, _request_rx) = mpsc::channel(8);
        let mut h = Handler::new(uri, Oid::new(), request_tx).unwrap();

        let src = Oid::new();
        let tst = Oid::new();
        h.add_file(src, FileKind::Src).await;
        h.add_file(tst, FileKind::Test).await;
        h.set_done().await;
        assert!(h.done, "done flag set directly before start");

        let spawn = h.take_spawn_state();
        assert_eq!(spawn.file_queue, VecDeque::from(vec![src]));
        assert_eq!(spawn.test_queue, VecDeque::from(vec![tst]));
        if let Some(filer) = spawn.filer {
            filer.shutdown().await.unwrap();
        }
    }
}
