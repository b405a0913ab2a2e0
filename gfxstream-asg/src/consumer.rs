// Host side of address space graphics rings
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    cmp::min,
    collections::HashMap,
    sync::{
        atomic::{fence, AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, trace, warn};

use crate::{
    blob::BlobMapping,
    config::AsgConfig,
    ops::Doorbell,
    protocol::Caps,
    render_thread::{RenderThreadContext, RenderThreadRegistry},
    ring::{RingFlags, RingLayout, SharedRing, TransferMode},
    virtgpu::stub::HostControl,
    Error, Result,
};

const REPLY_BACKOFF: Duration = Duration::from_micros(50);

/// Turns command bytes into work.
#[cfg_attr(test, mockall::automock)]
pub trait Decoder: Send {
    /// Handles as many complete packets from `data` as possible and returns
    /// how many bytes they used. Reply bytes go to `reply`.
    fn decode(&mut self, data: &[u8], reply: &mut Vec<u8>) -> Result<usize>;
}

/// Reads commands from the guest and writes replies back.
pub struct RingConsumer {
    ring: SharedRing,
    scratch: Vec<u8>,
    reply: Vec<u8>,
    /// Bytes of `reply` already in the reply ring.
    reply_sent: usize,
}

impl RingConsumer {
    pub fn new(ring: SharedRing) -> Self {
        Self {
            ring,
            scratch: Vec::new(),
            reply: Vec::new(),
            reply_sent: 0,
        }
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    /// Feeds every available byte to `decoder` and releases the bytes it
    /// used. Returns that count; zero means nothing could be decoded.
    ///
    /// Nothing is decoded while the reply of an earlier packet is still
    /// waiting for room in the reply ring.
    pub fn process(&mut self, decoder: &mut dyn Decoder) -> Result<usize> {
        if !self.flush_reply()? {
            return Ok(0);
        }
        let to_host = self.ring.to_host();
        let available = min(to_host.occupancy(), to_host.size()) as usize;
        if available == 0 {
            return Ok(0);
        }
        self.scratch.resize(available, 0);
        let copied = to_host.peek(&mut self.scratch)?;

        self.reply.clear();
        self.reply_sent = 0;
        let used = decoder.decode(&self.scratch[..copied], &mut self.reply)?;
        if used > copied {
            return Err(Error::ProtocolError(format!(
                "decoder used {used} of {copied} bytes"
            )));
        }
        if used == 0 && copied == to_host.size() as usize {
            return Err(Error::ProtocolError(
                "packet does not fit in the ring".to_string(),
            ));
        }
        to_host.consume(used as u32);
        trace!("consumed {used} bytes, replying {}", self.reply.len());

        if self.ring.flags().contains(RingFlags::WAKEUP_WANTED)
            && to_host.free() >= to_host.size() / 2
        {
            self.ring.clear_flags(RingFlags::WAKEUP_WANTED);
        }

        self.flush_reply()?;
        Ok(used)
    }

    pub fn has_pending_reply(&self) -> bool {
        self.reply_sent < self.reply.len()
    }

    /// Copies as much of the pending reply as the reply ring has room for.
    /// Returns true once all of it was handed to the guest.
    pub fn flush_reply(&mut self) -> Result<bool> {
        if !self.has_pending_reply() {
            return Ok(true);
        }
        let to_guest = self.ring.to_guest();
        let chunk = min(
            to_guest.free() as usize,
            self.reply.len() - self.reply_sent,
        );
        if chunk > 0 {
            to_guest.write_tail(&self.reply[self.reply_sent..self.reply_sent + chunk])?;
            to_guest.produce(chunk as u32);
            self.reply_sent += chunk;
        }
        Ok(!self.has_pending_reply())
    }
}

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    parked: usize,
    participants: usize,
}

/// Lets a coordinator stop every render thread between two packets.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

/// Membership of one thread in a `PauseGate`, released on drop.
#[derive(Debug)]
pub struct Participant {
    gate: Arc<PauseGate>,
}

impl Drop for Participant {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.participants -= 1;
        self.gate.cond.notify_all();
    }
}

impl PauseGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counts the calling thread among those `pause` waits for.
    pub fn join(self: &Arc<Self>) -> Participant {
        self.state.lock().unwrap().participants += 1;
        Participant { gate: self.clone() }
    }

    /// Parks the caller while a pause is in effect.
    pub fn safe_point(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.paused {
            return;
        }
        state.parked += 1;
        self.cond.notify_all();
        let mut state = self.cond.wait_while(state, |s| s.paused).unwrap();
        state.parked -= 1;
        self.cond.notify_all();
    }

    /// Blocks until every participant is parked.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = true;
        let state = self
            .cond
            .wait_while(state, |s| s.parked < s.participants)
            .unwrap();
        debug!("pause gate: {} threads parked", state.parked);
    }

    /// Lets parked threads go. With `wait` the call returns once all of them
    /// left their safe point.
    pub fn resume(&self, wait: bool) {
        let mut state = self.state.lock().unwrap();
        state.paused = false;
        self.cond.notify_all();
        if wait {
            state = self.cond.wait_while(state, |s| s.parked > 0).unwrap();
        }
        debug!("pause gate: resumed, {} threads", state.participants);
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    pub fn participants(&self) -> usize {
        self.state.lock().unwrap().participants
    }
}

/// Everything a render thread needs besides its ring.
#[derive(Clone, Debug)]
pub struct RenderThreadEnv {
    pub registry: Arc<RenderThreadRegistry>,
    pub gate: Arc<PauseGate>,
    pub idle_timeout: Duration,
}

/// A host thread decoding one ring.
#[derive(Debug)]
pub struct RenderThread {
    resource_id: u32,
    doorbell: Arc<Doorbell>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl RenderThread {
    /// Starts decoding `ring` with `decoder`. The thread runs with `context`,
    /// or a fresh one when `None`.
    pub fn spawn(
        resource_id: u32,
        ring: SharedRing,
        decoder: Box<dyn Decoder>,
        env: RenderThreadEnv,
        context: Option<RenderThreadContext>,
    ) -> Result<Self> {
        let doorbell = Arc::new(Doorbell::new()?);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            resource_id,
            consumer: RingConsumer::new(ring),
            decoder,
            doorbell: doorbell.clone(),
            stop: stop.clone(),
            env,
        };
        let handle = thread::Builder::new()
            .name(format!("render-{resource_id}"))
            .spawn(move || worker.run(context))
            .map_err(Error::Io)?;

        Ok(Self {
            resource_id,
            doorbell,
            stop,
            handle: Some(handle),
        })
    }

    pub const fn resource_id(&self) -> u32 {
        self.resource_id
    }

    pub fn doorbell(&self) -> &Arc<Doorbell> {
        &self.doorbell
    }

    pub fn wake(&self) -> Result<()> {
        self.doorbell.ring()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Asks the thread to exit and returns how it ended.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::Release);
        self.doorbell.ring()?;
        handle.join().unwrap_or_else(|_| {
            error!("render thread {} panicked", self.resource_id);
            Err(Error::StreamClosed)
        })
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!("render thread {} ended with {e}", self.resource_id);
        }
    }
}

struct Worker {
    resource_id: u32,
    consumer: RingConsumer,
    decoder: Box<dyn Decoder>,
    doorbell: Arc<Doorbell>,
    stop: Arc<AtomicBool>,
    env: RenderThreadEnv,
}

impl Worker {
    fn run(mut self, context: Option<RenderThreadContext>) -> Result<()> {
        let _participant = self.env.gate.join();
        let context = match context {
            Some(context) => {
                context.bind_current();
                context
            }
            None => RenderThreadContext::new(&self.env.registry),
        };
        info!(
            "render thread {} started, puid {:?}",
            self.resource_id,
            context.puid()
        );

        let ret = self.process_loop();
        match &ret {
            Ok(()) => info!("render thread {} exited", self.resource_id),
            Err(e) => {
                error!("render thread {} failed: {e}", self.resource_id);
                self.consumer.ring().set_transfer_mode(TransferMode::Error);
            }
        }
        ret
    }

    fn process_loop(&mut self) -> Result<()> {
        let ring = self.consumer.ring().clone();
        // The guest activates the ring after the host learnt about it.
        let mut activated = false;
        let mut reply_backoff = REPLY_BACKOFF;

        loop {
            self.env.gate.safe_point();
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let closing = match ring.transfer_mode() {
                Some(TransferMode::Active) => {
                    activated = true;
                    false
                }
                Some(TransferMode::Idle) if !activated => {
                    self.doorbell.wait_timeout(self.env.idle_timeout)?;
                    continue;
                }
                Some(TransferMode::Idle) => true,
                Some(TransferMode::Error) => {
                    debug!("render thread {}: ring in error", self.resource_id);
                    return Ok(());
                }
                None => {
                    return Err(Error::ProtocolError(
                        "unknown transfer mode".to_string(),
                    ))
                }
            };

            if self.consumer.has_pending_reply() {
                if self.consumer.flush_reply()? {
                    reply_backoff = REPLY_BACKOFF;
                } else if closing {
                    debug!(
                        "render thread {}: guest left with a pending reply",
                        self.resource_id
                    );
                    return Ok(());
                } else {
                    // Back to the safe point and the stop check while the
                    // guest makes room.
                    thread::sleep(reply_backoff);
                    reply_backoff = min(reply_backoff * 2, self.env.idle_timeout);
                    continue;
                }
            }

            let seen = ring.to_host().write_pos();
            if self.consumer.process(self.decoder.as_mut())? > 0 {
                continue;
            }
            if closing {
                return Ok(());
            }

            ring.set_flags(RingFlags::CONSUMER_IDLE);
            ring.clear_flags(RingFlags::PING_IN_FLIGHT);
            // Pairs with the fence the producer issues after publishing.
            fence(Ordering::SeqCst);
            if ring.to_host().write_pos() == seen
                && ring.transfer_mode() == Some(TransferMode::Active)
            {
                self.doorbell.wait_timeout(self.env.idle_timeout)?;
            }
            ring.clear_flags(RingFlags::CONSUMER_IDLE);
        }
    }
}

type DecoderFactory = dyn Fn(u32) -> Box<dyn Decoder> + Send + Sync;

/// Receives control commands and runs one render thread per ring.
pub struct HostFrontend {
    caps: Caps,
    env: RenderThreadEnv,
    new_decoder: Box<DecoderFactory>,
    threads: Mutex<HashMap<u32, RenderThread>>,
}

impl HostFrontend {
    pub fn new<F>(caps: Caps, config: &AsgConfig, new_decoder: F) -> Self
    where
        F: Fn(u32) -> Box<dyn Decoder> + Send + Sync + 'static,
    {
        Self {
            caps,
            env: RenderThreadEnv {
                registry: RenderThreadRegistry::new(),
                gate: PauseGate::new(),
                idle_timeout: config.consumer_idle_timeout(),
            },
            new_decoder: Box::new(new_decoder),
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RenderThreadRegistry> {
        &self.env.registry
    }

    pub fn gate(&self) -> &Arc<PauseGate> {
        &self.env.gate
    }

    pub fn env(&self) -> &RenderThreadEnv {
        &self.env
    }

    pub fn render_threads(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// Stops the render thread of `resource_id`.
    pub fn destroy_context(&self, resource_id: u32) -> Result<()> {
        let thread = self
            .threads
            .lock()
            .unwrap()
            .remove(&resource_id)
            .ok_or_else(|| Error::InvalidResource(format!("no context on {resource_id}")))?;
        thread.stop()
    }
}

impl HostControl for HostFrontend {
    fn context_create(&self, resource_id: u32, mapping: BlobMapping) -> Result<()> {
        let layout = RingLayout::from_caps(&self.caps)?;
        let ring = SharedRing::new(Arc::new(mapping), layout)?;
        let thread = RenderThread::spawn(
            resource_id,
            ring,
            (self.new_decoder)(resource_id),
            self.env.clone(),
            None,
        )?;

        let mut threads = self.threads.lock().unwrap();
        threads.retain(|_, thread| !thread.is_finished());
        if threads.insert(resource_id, thread).is_some() {
            warn!("context on resource {resource_id} replaced");
        }
        Ok(())
    }

    fn context_ping(&self, resource_id: u32) -> Result<()> {
        let threads = self.threads.lock().unwrap();
        let thread = threads
            .get(&resource_id)
            .ok_or_else(|| Error::InvalidResource(format!("no context on {resource_id}")))?;
        thread.wake()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        time::{Duration, Instant},
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::testutils::{anonymous_ring, EchoDecoder};

    fn test_env() -> RenderThreadEnv {
        RenderThreadEnv {
            registry: RenderThreadRegistry::new(),
            gate: PauseGate::new(),
            idle_timeout: Duration::from_millis(5),
        }
    }

    /// Feeds commands to an echoing render thread until its reply ring is
    /// full and commands are left waiting behind the stuck reply.
    fn stall_replies(ring: &SharedRing, thread: &RenderThread) {
        let start = Instant::now();
        while ring.to_guest().free() > 0 || ring.to_host().is_empty() {
            assert!(start.elapsed() < Duration::from_secs(10));
            let to_host = ring.to_host();
            let n = min(to_host.free(), 16);
            if n > 0 {
                to_host.write_tail(&vec![0; n as usize]).unwrap();
                to_host.produce(n);
                thread.wake().unwrap();
            }
            thread::yield_now();
        }
    }

    #[test]
    fn test_process_partial_packets() {
        let ring = anonymous_ring(64);
        ring.init();
        ring.to_host().write_tail(&[1, 2, 3, 4, 5, 6]).unwrap();
        ring.to_host().produce(6);

        let mut decoder = MockDecoder::new();
        // Four byte packets: only the first one is complete.
        decoder
            .expect_decode()
            .times(1)
            .returning(|data, reply| {
                assert_eq!(data, &[1, 2, 3, 4, 5, 6]);
                reply.push(0xa1);
                Ok(4)
            });
        let mut consumer = RingConsumer::new(ring.clone());
        assert_eq!(consumer.process(&mut decoder).unwrap(), 4);
        assert_eq!(ring.to_host().occupancy(), 2);

        let mut reply = [0; 1];
        assert_eq!(ring.to_guest().pop(&mut reply).unwrap(), 1);
        assert_eq!(reply, [0xa1]);
    }

    #[test]
    fn test_process_rejects_oversized_packet() {
        let ring = anonymous_ring(64);
        ring.init();
        ring.to_host().write_tail(&[0; 64]).unwrap();
        ring.to_host().produce(64);

        let mut decoder = MockDecoder::new();
        decoder.expect_decode().returning(|_, _| Ok(0));
        let mut consumer = RingConsumer::new(ring.clone());
        assert_matches!(consumer.process(&mut decoder), Err(Error::ProtocolError(_)));

        let mut decoder = MockDecoder::new();
        decoder.expect_decode().returning(|data, _| Ok(data.len() + 1));
        assert_matches!(consumer.process(&mut decoder), Err(Error::ProtocolError(_)));
    }

    #[test]
    fn test_wakeup_wanted_cleared() {
        let ring = anonymous_ring(64);
        ring.init();
        ring.to_host().write_tail(&[0; 64]).unwrap();
        ring.to_host().produce(64);
        ring.set_flags(RingFlags::WAKEUP_WANTED);

        let mut decoder = MockDecoder::new();
        let mut calls = 0;
        decoder.expect_decode().returning(move |_, _| {
            calls += 1;
            Ok(if calls == 1 { 16 } else { 32 })
        });
        let mut consumer = RingConsumer::new(ring.clone());
        consumer.process(&mut decoder).unwrap();
        // 16 free bytes are not enough.
        assert!(ring.flags().contains(RingFlags::WAKEUP_WANTED));
        consumer.process(&mut decoder).unwrap();
        assert!(!ring.flags().contains(RingFlags::WAKEUP_WANTED));
    }

    #[test]
    fn test_pause_gate() {
        let gate = PauseGate::new();
        let parked = Arc::new(AtomicBool::new(false));
        let handle = {
            let gate = gate.clone();
            let parked = parked.clone();
            let participant = gate.join();
            thread::spawn(move || {
                let _participant = participant;
                while !gate.is_paused() {
                    thread::yield_now();
                }
                gate.safe_point();
                parked.store(true, Ordering::Release);
            })
        };

        gate.pause();
        assert!(!parked.load(Ordering::Acquire));
        gate.resume(true);
        handle.join().unwrap();
        assert!(parked.load(Ordering::Acquire));
        assert_eq!(gate.participants(), 0);
        // Nobody to wait for.
        gate.pause();
        gate.resume(false);
    }

    #[test]
    fn test_render_thread_echo() {
        let ring = anonymous_ring(64);
        let registry = RenderThreadRegistry::new();
        let env = RenderThreadEnv {
            registry: registry.clone(),
            gate: PauseGate::new(),
            idle_timeout: Duration::from_millis(5),
        };
        let thread =
            RenderThread::spawn(3, ring.clone(), Box::new(EchoDecoder), env, None).unwrap();

        ring.init();
        ring.to_host().write_tail(&[1, 2]).unwrap();
        ring.to_host().produce(2);
        thread.wake().unwrap();

        let mut reply = [0; 2];
        let mut got = 0;
        while got < 2 {
            got += ring.to_guest().pop(&mut reply[got..]).unwrap();
            thread::yield_now();
        }
        assert_eq!(reply, [0xa1, 0xa2]);
        assert_eq!(registry.len(), 1);

        thread.stop().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reply_held_until_guest_reads() {
        let ring = anonymous_ring(64);
        ring.init();
        ring.to_guest().write_tail(&[0; 2046]).unwrap();
        ring.to_guest().produce(2046);
        ring.to_host().write_tail(&[1, 2, 3, 4]).unwrap();
        ring.to_host().produce(4);

        let mut consumer = RingConsumer::new(ring.clone());
        let mut decoder = EchoDecoder;
        assert_eq!(consumer.process(&mut decoder).unwrap(), 4);
        assert!(consumer.has_pending_reply());
        assert_eq!(ring.to_guest().free(), 0);

        // No decoding behind a pending reply.
        ring.to_host().write_tail(&[5]).unwrap();
        ring.to_host().produce(1);
        assert_eq!(consumer.process(&mut decoder).unwrap(), 0);
        assert_eq!(ring.to_host().occupancy(), 1);

        let mut old = vec![0; 2046];
        ring.to_guest().pop(&mut old).unwrap();
        assert!(consumer.flush_reply().unwrap());
        let mut reply = [0; 4];
        assert_eq!(ring.to_guest().pop(&mut reply).unwrap(), 4);
        assert_eq!(reply, [0xa1, 0xa2, 0xa3, 0xa4]);
        assert_eq!(consumer.process(&mut decoder).unwrap(), 1);
    }

    #[test]
    fn test_pause_with_full_reply_ring() {
        let ring = anonymous_ring(64);
        ring.init();
        let env = test_env();
        let gate = env.gate.clone();
        let thread =
            RenderThread::spawn(5, ring.clone(), Box::new(EchoDecoder), env, None).unwrap();
        stall_replies(&ring, &thread);

        let (tx, rx) = mpsc::channel();
        let pauser = {
            let gate = gate.clone();
            thread::spawn(move || {
                gate.pause();
                tx.send(()).unwrap();
            })
        };
        rx.recv_timeout(Duration::from_secs(5))
            .expect("render thread never parked");
        pauser.join().unwrap();
        gate.resume(true);

        // The guest catches up and the stuck commands get decoded.
        let mut replies = vec![0; 4096];
        let start = Instant::now();
        while !ring.to_host().is_empty() || ring.to_guest().occupancy() > 0 {
            assert!(start.elapsed() < Duration::from_secs(10));
            ring.to_guest().pop(&mut replies).unwrap();
            thread::yield_now();
        }
        thread.stop().unwrap();
    }

    #[test]
    fn test_stop_with_full_reply_ring() {
        let ring = anonymous_ring(64);
        ring.init();
        let env = test_env();
        let registry = env.registry.clone();
        let thread =
            RenderThread::spawn(6, ring.clone(), Box::new(EchoDecoder), env, None).unwrap();
        stall_replies(&ring, &thread);

        let (tx, rx) = mpsc::channel();
        let stopper = thread::spawn(move || tx.send(thread.stop().is_ok()).unwrap());
        let stopped_cleanly = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("render thread never stopped");
        assert!(stopped_cleanly);
        stopper.join().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_render_thread_protocol_error() {
        let ring = anonymous_ring(64);
        let env = RenderThreadEnv {
            registry: RenderThreadRegistry::new(),
            gate: PauseGate::new(),
            idle_timeout: Duration::from_millis(5),
        };
        let mut decoder = MockDecoder::new();
        decoder
            .expect_decode()
            .returning(|_, _| Err(Error::ProtocolError("bad opcode".to_string())));
        let thread = RenderThread::spawn(4, ring.clone(), Box::new(decoder), env, None).unwrap();

        ring.init();
        ring.to_host().write_tail(&[0xff]).unwrap();
        ring.to_host().produce(1);
        thread.wake().unwrap();

        while ring.transfer_mode() != Some(TransferMode::Error) {
            thread::yield_now();
        }
        assert_matches!(thread.stop(), Err(Error::ProtocolError(_)));
    }

    #[test]
    fn test_frontend_ping_unknown_context() {
        let frontend = HostFrontend::new(
            Caps::host_default(crate::protocol::Capset::GfxstreamVulkan),
            &AsgConfig::default(),
            |_| Box::new(EchoDecoder),
        );
        assert_matches!(frontend.context_ping(1), Err(Error::InvalidResource(_)));
        assert_matches!(frontend.destroy_context(1), Err(Error::InvalidResource(_)));
        assert_eq!(frontend.render_threads(), 0);
    }
}
