//! The connection driver.
//!
//! Each established connection runs as one spawned task owning the stream,
//! the codec, and the wait-list of sent-but-unanswered requests. Responses
//! are matched to the wait-list strictly in order; anything else is a
//! protocol error that kills the connection. On wind-down, requests whose
//! response never began are handed back for another attempt when their
//! budget allows, everything else fails in place.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace};

use crate::body::{Body, ResponseBody};
use crate::codec::{DecodeEvent, HttpCodec, ResponseHead};
use crate::config::Config;
use crate::error::{Error, Phase};
use crate::peer::{ConnHandle, ConnStats, Peer};
use crate::request::{Outcome, Response, Task, Tunnel};
use crate::transport::{BoxIo, PrefixedIo};

const BODY_CHANNEL_CAPACITY: usize = 8;
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24);

/// Spawn the driver for an established stream, returning the peer's
/// handle on it.
pub(crate) fn spawn(
    id: u64,
    peer: Arc<Peer>,
    config: Config,
    io: BoxIo,
    codec: Box<dyn HttpCodec>,
) -> ConnHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(ConnStats::default());
    let conn = Conn {
        id,
        peer,
        config,
        io,
        codec,
        rx,
        stats: stats.clone(),
        read_buf: BytesMut::new(),
        write_buf: BytesMut::new(),
        wait: VecDeque::new(),
        successes: 0,
        rx_closed: false,
        close_after_drain: false,
    };
    tokio::spawn(conn.run());
    ConnHandle { id, tx, stats }
}

/// A request on the wait-list: sent, response not yet complete.
struct Inflight {
    task: Task,
    deadline: Instant,
    body_tx: Option<mpsc::Sender<Result<Bytes, Error>>>,
    /// The response head was delivered to the caller.
    delivered: bool,
    /// Read out the payload for framing but deliver nothing.
    discard: bool,
    redirect: Option<ResponseHead>,
    retry_after: Option<Duration>,
    /// The (final) response head has arrived.
    begun: bool,
}

enum Exit {
    /// Closed after the idle timeout with nothing outstanding.
    Idle,
    /// Closed in an orderly way (peer asked, or no more work can arrive).
    Closed,
    /// A CONNECT succeeded; the stream leaves the driver as a tunnel.
    Tunnel(Inflight),
}

enum AfterContinue {
    SendPayload,
    ResponseArrived,
    Exit(Exit),
}

struct Conn {
    id: u64,
    peer: Arc<Peer>,
    config: Config,
    io: BoxIo,
    codec: Box<dyn HttpCodec>,
    rx: mpsc::UnboundedReceiver<Task>,
    stats: Arc<ConnStats>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    wait: VecDeque<Inflight>,
    /// Keep-alive responses completed on this connection; the second one
    /// is what proves the peer tolerates back-to-back requests.
    successes: u32,
    rx_closed: bool,
    close_after_drain: bool,
}

impl Conn {
    async fn run(mut self) {
        let result = self.drive().await;
        self.stats.set_closing();
        match &result {
            Ok(_) => trace!(conn.id = self.id, "connection closing"),
            Err(error) => debug!(conn.id = self.id, %error, "connection failed"),
        }
        self.finalize(result).await;
    }

    async fn drive(&mut self) -> Result<Exit, Error> {
        loop {
            self.flush().await?;

            if let Some(exit) = self.process_buffered().await? {
                return Ok(exit);
            }

            if (self.rx_closed || self.close_after_drain) && self.wait.is_empty() {
                return Ok(Exit::Closed);
            }

            let accept =
                !self.rx_closed && !self.close_after_drain && self.wait.len() < self.capacity();
            // The deadline covers the span until a response begins; an
            // already-streaming payload is paced by the reads themselves.
            let next_deadline = self
                .wait
                .iter()
                .find(|inflight| !inflight.begun)
                .map(|inflight| inflight.deadline);
            let has_deadline = next_deadline.is_some();
            let response_deadline = next_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);
            let idle = self.wait.is_empty();

            tokio::select! {
                // Reads win over new work: bytes already on the wire must
                // be matched against the wait-list as it stands, never
                // against a request sent after them.
                biased;

                read = self.io.read_buf(&mut self.read_buf) => {
                    let n = read.map_err(|error| Error::lost(error))?;
                    if n == 0 {
                        return if self.wait.is_empty() {
                            Ok(Exit::Closed)
                        } else {
                            Err(Error::lost("connection closed by peer"))
                        };
                    }
                }
                task = self.rx.recv(), if accept => {
                    match task {
                        Some(task) => {
                            if let Some(exit) = self.send_request(task).await? {
                                return Ok(exit);
                            }
                        }
                        None => self.rx_closed = true,
                    }
                }
                _ = sleep_until(response_deadline), if has_deadline => {
                    return Err(Error::Timeout(Phase::Response));
                }
                _ = sleep(self.config.idle_timeout), if idle => {
                    trace!(conn.id = self.id, "idle timeout");
                    return Ok(Exit::Idle);
                }
            }
        }
    }

    fn capacity(&self) -> usize {
        if self.peer.allows_pipelining() && self.config.pipelining_configured() {
            self.config.max_pipelined_requests
        } else {
            1
        }
    }

    async fn process_buffered(&mut self) -> Result<Option<Exit>, Error> {
        loop {
            let event = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(|error| Error::protocol(error))?;
            let Some(event) = event else {
                return Ok(None);
            };
            match event {
                DecodeEvent::Continue => {
                    // An interim nobody is waiting for.
                    trace!(conn.id = self.id, "ignoring stray 100 continue");
                }
                DecodeEvent::Head(head) => {
                    if let Some(exit) = self.on_head(head)? {
                        return Ok(Some(exit));
                    }
                }
                DecodeEvent::Body(chunk) => self.on_body(chunk).await?,
                DecodeEvent::End => self.on_end()?,
            }
        }
    }

    fn on_head(&mut self, head: ResponseHead) -> Result<Option<Exit>, Error> {
        if head.status.is_informational() {
            return Ok(None);
        }

        let (tunnel_ready, withdrawn) = {
            let front = self
                .wait
                .front_mut()
                .ok_or_else(|| Error::protocol("response without an outstanding request"))?;
            front.begun = true;
            (
                front.task.connect_tunnel && head.status.is_success(),
                front.task.is_cancelled(),
            )
        };
        if head.close {
            self.close_after_drain = true;
            // A server that demands close has not proven it tolerates
            // back-to-back requests after all.
            self.peer.note_pipelining_broken();
        }
        if withdrawn {
            // Drain this response for framing, then close: abandoning it
            // mid-stream would corrupt ordering for pipelined successors.
            trace!(conn.id = self.id, "response for a withdrawn request, closing after drain");
            let front = self.wait.front_mut().expect("front checked above");
            front.discard = true;
            self.close_after_drain = true;
            return Ok(None);
        }
        if tunnel_ready {
            let inflight = self.wait.pop_front().expect("front checked above");
            return Ok(Some(Exit::Tunnel(inflight)));
        }

        let front = self.wait.front_mut().expect("front checked above");

        if matches!(head.status.as_u16(), 301 | 302 | 303 | 307 | 308) && head.location().is_some()
        {
            trace!(conn.id = self.id, request.id = front.task.id, status = %head.status,
                "redirect received");
            front.redirect = Some(head);
            front.discard = true;
            return Ok(None);
        }

        let parked = matches!(head.status.as_u16(), 429 | 503)
            && head.retry_after().is_some()
            && front.task.attempts < self.config.max_attempts
            && front.task.can_replay_body()
            && !front.task.is_cancelled();
        if parked {
            front.retry_after = head.retry_after();
            front.discard = true;
            return Ok(None);
        }

        let (tx, body) = ResponseBody::channel(BODY_CHANNEL_CAPACITY);
        front.delivered = true;
        front.body_tx = Some(tx);
        front
            .task
            .complete(Ok(Outcome::Response(Response::new(head, body))));
        Ok(None)
    }

    async fn on_body(&mut self, chunk: Bytes) -> Result<(), Error> {
        let front = self
            .wait
            .front_mut()
            .ok_or_else(|| Error::protocol("payload without an outstanding request"))?;
        if front.discard {
            return Ok(());
        }
        if let Some(tx) = &front.body_tx {
            if tx.send(Ok(chunk)).await.is_err() {
                // Receiver dropped; keep reading for framing, deliver nothing.
                front.body_tx = None;
            }
        }
        Ok(())
    }

    fn on_end(&mut self) -> Result<(), Error> {
        let Some(mut inflight) = self.wait.pop_front() else {
            return Err(Error::protocol("payload end without an outstanding request"));
        };
        self.stats.decr_pending();

        if let Some(head) = inflight.redirect.take() {
            let mut task = inflight.task;
            let location = head.location().unwrap_or_default().to_owned();
            match task.apply_redirect(head.status, &location, self.config.max_redirects) {
                Ok(()) => {
                    debug!(request.id = task.id, authority = %task.authority,
                        redirects = task.redirects, "following redirect");
                    self.peer.resubmit(task);
                }
                Err(error) => task.fail(error),
            }
        } else if let Some(delay) = inflight.retry_after.take() {
            let peer = self.peer.clone();
            let mut task = inflight.task;
            task.delayed = true;
            debug!(request.id = task.id, ?delay, "parking request per retry-after");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                peer.resubmit(task);
            });
        } else {
            drop(inflight.body_tx.take());
            if inflight.delivered && !self.close_after_drain {
                self.successes += 1;
                if self.successes == 2 {
                    self.peer.note_pipelining_ok();
                }
            }
        }

        self.peer.schedule_dispatch();
        Ok(())
    }

    async fn send_request(&mut self, mut task: Task) -> Result<Option<Exit>, Error> {
        if task.is_cancelled() {
            self.stats.decr_pending();
            return Ok(None);
        }

        task.attempts += 1;
        let expect = self.peer.wants_payload_sync(&task, &self.config);
        let has_body = !task.body.is_empty();
        let chunked = task.body.is_chunked();
        let head = task.request_head(expect);
        trace!(conn.id = self.id, request.id = task.id, method = %head.method,
            target = %head.target, attempt = task.attempts, expect, "sending request");

        self.codec.encode_head(&head, &mut self.write_buf);
        self.wait.push_back(Inflight {
            task,
            deadline: Instant::now() + self.config.request_timeout,
            body_tx: None,
            delivered: false,
            discard: false,
            redirect: None,
            retry_after: None,
            begun: false,
        });
        self.flush().await?;

        let send_payload = if expect {
            match self.await_continue().await? {
                AfterContinue::SendPayload => true,
                AfterContinue::ResponseArrived => false,
                AfterContinue::Exit(exit) => return Ok(Some(exit)),
            }
        } else {
            true
        };

        if send_payload && has_body {
            self.send_payload(chunked).await?;
        }
        Ok(None)
    }

    /// Wait for the server's verdict on `Expect: 100-continue`: an interim
    /// (send the payload), an early final response (don't), or the timeout
    /// (send it anyway and remember the peer does not negotiate).
    async fn await_continue(&mut self) -> Result<AfterContinue, Error> {
        let deadline = Instant::now() + self.config.continue_timeout;
        loop {
            loop {
                let event = self
                    .codec
                    .decode(&mut self.read_buf)
                    .map_err(|error| Error::protocol(error))?;
                let Some(event) = event else { break };
                match event {
                    DecodeEvent::Continue => {
                        self.peer.note_seen_continue();
                        return Ok(AfterContinue::SendPayload);
                    }
                    DecodeEvent::Head(head) => {
                        // With earlier pipelined requests outstanding the
                        // head belongs to the oldest of them, not to us.
                        let ours = self.wait.len() == 1;
                        if let Some(exit) = self.on_head(head)? {
                            return Ok(AfterContinue::Exit(exit));
                        }
                        if ours {
                            return Ok(AfterContinue::ResponseArrived);
                        }
                    }
                    DecodeEvent::Body(chunk) => self.on_body(chunk).await?,
                    DecodeEvent::End => self.on_end()?,
                }
            }

            tokio::select! {
                read = self.io.read_buf(&mut self.read_buf) => {
                    let n = read.map_err(|error| Error::lost(error))?;
                    if n == 0 {
                        return Err(Error::lost("connection closed awaiting continue"));
                    }
                }
                _ = sleep_until(deadline) => {
                    self.peer.note_continue_timeout();
                    return Ok(AfterContinue::SendPayload);
                }
            }
        }
    }

    async fn send_payload(&mut self, chunked: bool) -> Result<(), Error> {
        // A buffered body must survive retries and redirects; send a copy.
        let full = match self.wait.back().map(|inflight| &inflight.task.body) {
            Some(Body::Full(bytes)) => Some(bytes.clone()),
            _ => None,
        };
        if let Some(bytes) = full {
            self.codec
                .encode_body_chunk(&bytes, chunked, &mut self.write_buf);
            self.codec.encode_body_end(chunked, &mut self.write_buf);
            return self.flush().await;
        }

        let declared = self.wait.back().and_then(|inflight| inflight.task.body.len());
        let mut sent: u64 = 0;
        loop {
            let next = match self.wait.back_mut() {
                Some(inflight) => {
                    inflight.task.body_started = true;
                    inflight.task.body.next_chunk().await
                }
                None => None,
            };
            match next {
                Some(Ok(chunk)) => {
                    // The header promised at most `declared` bytes; a
                    // stream that keeps going past that cannot be framed.
                    sent += chunk.len() as u64;
                    if declared.is_some_and(|limit| sent > limit) {
                        if let Some(mut inflight) = self.wait.pop_back() {
                            self.stats.decr_pending();
                            inflight.task.fail(Error::Payload(
                                "stream produced more than the declared payload size".into(),
                            ));
                        }
                        return Err(Error::lost("request payload exceeded its declared size"));
                    }
                    self.codec
                        .encode_body_chunk(&chunk, chunked, &mut self.write_buf);
                    self.flush().await?;
                }
                Some(Err(error)) => {
                    // The caller's stream failed; the request fails here
                    // but the connection state is indeterminate mid-body.
                    if let Some(mut inflight) = self.wait.pop_back() {
                        self.stats.decr_pending();
                        inflight.task.fail(Error::Payload(error.to_string().into()));
                    }
                    return Err(Error::lost("request payload stream failed"));
                }
                None => {
                    self.codec.encode_body_end(chunked, &mut self.write_buf);
                    return self.flush().await;
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.io
            .write_all_buf(&mut self.write_buf)
            .await
            .map_err(|error| Error::lost(error))?;
        self.io.flush().await.map_err(|error| Error::lost(error))
    }

    async fn finalize(mut self, result: Result<Exit, Error>) {
        self.rx.close();

        if result.is_err() && self.wait.len() > 1 {
            // Lost mid-pipeline; the peer must earn pipelining again.
            self.peer.note_pipelining_broken();
        }

        let error = match &result {
            Err(error) => error.clone(),
            Ok(_) => Error::lost("connection closed"),
        };

        // Wait-listed requests: a delivered response gets the error on its
        // payload stream; an unanswered one is retried when its budget and
        // body allow, and fails in place otherwise.
        let mut first = true;
        while let Some(mut inflight) = self.wait.pop_front() {
            self.stats.decr_pending();
            let err = if first {
                error.clone()
            } else {
                Error::lost("connection closed with requests outstanding")
            };
            first = false;

            if inflight.delivered {
                if let Some(tx) = inflight.body_tx.take() {
                    let _ = tx.try_send(Err(err));
                }
            } else if err.is_retryable()
                && inflight.task.attempts < self.config.max_attempts
                && inflight.task.can_replay_body()
                && !inflight.task.is_cancelled()
            {
                trace!(request.id = inflight.task.id, attempt = inflight.task.attempts,
                    "handing request back for another attempt");
                self.peer.resubmit(inflight.task);
            } else {
                inflight.task.fail(err);
            }
        }

        // Requests handed over but never pulled from the channel were
        // never sent; they go straight back to their queues.
        while let Ok(task) = self.rx.try_recv() {
            self.stats.decr_pending();
            self.peer.resubmit(task);
        }

        if let Ok(Exit::Tunnel(mut inflight)) = result {
            self.stats.decr_pending();
            let leftover = self.read_buf.split().freeze();
            let io: BoxIo = if leftover.is_empty() {
                self.io
            } else {
                Box::new(PrefixedIo::new(leftover, self.io))
            };
            debug!(conn.id = self.id, request.id = inflight.task.id, "connection became a tunnel");
            inflight
                .task
                .complete(Ok(Outcome::Tunnel(Tunnel::new(io))));
        }

        self.peer.remove_conn(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_future_is_spawnable() {
        // `spawn` hands the driver to tokio::spawn, which needs `Send`
        // even while a wait-list borrow is parked at an await point.
        fn driver(conn: Conn) -> impl std::future::Future<Output = ()> + Send {
            conn.run()
        }
        let _ = driver;
    }
}
