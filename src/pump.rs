//! Dispatcher tasks: the TX pump, the RX pump and the bus reader that frames
//! inbound bytes into buffers.

use crate::buffer::{BufferHandle, InterfaceType};
use crate::bus::BusError;
use crate::channel::DispatchOutcome;
use crate::control::ControlMessage;
use crate::frame::{self, FrameHeader};
use crate::queue::{Priority, PriorityBank, Wake};
use crate::stats::{add, inc};
use crate::transport::Link;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Running pump tasks plus the signal that stops them.
pub(crate) struct Pumps {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pumps {
    /// Start the TX pump, RX pump and bus reader. None of them needs the bus
    /// to be ready yet.
    pub(crate) fn spawn(link: &Arc<Link>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            ("tx-pump", tokio::spawn(run_tx_pump(Arc::clone(link), shutdown.subscribe()))),
            ("rx-pump", tokio::spawn(run_rx_pump(Arc::clone(link), shutdown.subscribe()))),
            ("bus-reader", tokio::spawn(run_bus_reader(Arc::clone(link), shutdown.subscribe()))),
        ];
        debug!("pumps started");
        Self { shutdown, tasks }
    }

    /// Signal shutdown and wait for every task to exit.
    pub(crate) async fn stop(self) {
        self.shutdown.send_replace(true);
        for (name, task) in self.tasks {
            if let Err(err) = task.await {
                warn!(task = name, error = %err, "pump task ended abnormally");
            }
        }
        debug!("pumps stopped");
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Wait on a bank's wake signal, giving up early on shutdown.
async fn wait_for_work(
    bank: &PriorityBank,
    timeout: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Wake> {
    tokio::select! {
        biased;
        _ = shutdown.changed() => None,
        wake = bank.wait(timeout) => Some(wake),
    }
}

/// Sleep unless shutdown arrives first. Returns `false` on shutdown.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub(crate) async fn run_tx_pump(link: Arc<Link>, mut shutdown: watch::Receiver<bool>) {
    let timeout = link.config.pump_wait_timeout();
    loop {
        if stopping(&shutdown) {
            break;
        }
        match wait_for_work(&link.tx, timeout, &mut shutdown).await {
            None | Some(Wake::Closed) => break,
            Some(Wake::TimedOut) => continue,
            Some(Wake::Signalled) => {}
        }

        let pass = tx_pass(&link).await;
        link.tx.settle(pass.removed);
        if pass.throttled && !pause(link.config.throttle_backoff(), &mut shutdown).await {
            break;
        }
    }
    info!("tx pump exiting");
}

struct TxPass {
    /// Items that left the bank for good during this pass.
    removed: usize,
    throttled: bool,
}

/// One scan over every priority, highest first, taking at most
/// `max_drain_per_priority` items from each.
async fn tx_pass(link: &Link) -> TxPass {
    let mut pass = TxPass {
        removed: 0,
        throttled: false,
    };

    for index in 0..link.tx.priorities() {
        let priority = Priority::new(index as u8);
        for _ in 0..link.config.max_drain_per_priority {
            let mut handle = match link.tx.try_dequeue(priority) {
                Some(handle) => handle,
                None => break,
            };

            if link.flow.holds(handle.if_type()) {
                handle.throttle_retries += 1;
                if handle.throttle_retries > link.config.max_throttle_retries {
                    inc(&link.stats.tx_throttle_drops);
                    warn!(if_type = %handle.if_type(), "throttle retries exhausted, dropping buffer");
                    pass.removed += 1;
                    continue;
                }
                match link.tx.requeue_front(priority, handle) {
                    Ok(()) => inc(&link.stats.tx_throttle_requeues),
                    Err(err) => {
                        inc(&link.stats.tx_throttle_drops);
                        warn!(error = %err, "could not requeue throttled buffer");
                        pass.removed += 1;
                    }
                }
                pass.throttled = true;
                break;
            }

            pass.removed += 1;
            transmit(link, handle).await;
        }
    }
    pass
}

/// Frame and write one buffer, then release it whatever the outcome.
async fn transmit(link: &Link, handle: BufferHandle) {
    let header = FrameHeader::new(handle.if_type(), handle.if_num()).with_seq(link.next_tx_seq());
    match frame::encode(&header, handle.payload(), link.checksum_enabled()) {
        Ok(bytes) => match link.bus.send(&bytes).await {
            Ok(written) => {
                inc(&link.stats.tx_sent);
                add(&link.stats.tx_bytes, written as u64);
                if handle.if_type() == InterfaceType::Test {
                    inc(&link.stats.raw_tp_tx_frames);
                }
                trace!(if_type = %handle.if_type(), seq = header.seq, len = handle.len(), "frame sent");
            }
            Err(err) => {
                inc(&link.stats.tx_send_errors);
                warn!(if_type = %handle.if_type(), error = %err, "bus send failed");
            }
        },
        Err(err) => {
            inc(&link.stats.tx_send_errors);
            warn!(if_type = %handle.if_type(), error = %err, "could not frame buffer");
        }
    }
    handle.release();
}

pub(crate) async fn run_rx_pump(link: Arc<Link>, mut shutdown: watch::Receiver<bool>) {
    let timeout = link.config.pump_wait_timeout();
    loop {
        if stopping(&shutdown) {
            break;
        }
        match wait_for_work(&link.rx, timeout, &mut shutdown).await {
            None | Some(Wake::Closed) => break,
            Some(Wake::TimedOut) => continue,
            Some(Wake::Signalled) => {}
        }

        let mut drained = 0;
        for index in 0..link.rx.priorities() {
            let priority = Priority::new(index as u8);
            for _ in 0..link.config.max_drain_per_priority {
                match link.rx.try_dequeue(priority) {
                    Some(handle) => {
                        drained += 1;
                        route_inbound(&link, handle);
                    }
                    None => break,
                }
            }
        }
        link.rx.settle(drained);
    }
    info!("rx pump exiting");
}

/// Send an inbound buffer to the control handler, the raw-throughput
/// counters, or the channel registry.
pub(crate) fn route_inbound(link: &Link, handle: BufferHandle) {
    match handle.if_type() {
        InterfaceType::Priv => handle_control(link, handle),
        InterfaceType::Test => {
            inc(&link.stats.raw_tp_rx_frames);
            add(&link.stats.raw_tp_rx_bytes, handle.len() as u64);
            handle.release();
        }
        _ => match link.registry.dispatch_inbound(handle) {
            DispatchOutcome::Delivered => inc(&link.stats.rx_dispatched),
            DispatchOutcome::NoChannel => inc(&link.stats.rx_no_channel),
            DispatchOutcome::Reserved => {}
        },
    }
}

fn handle_control(link: &Link, handle: BufferHandle) {
    inc(&link.stats.rx_priv);
    let message = ControlMessage::decode(handle.payload());
    handle.release();

    let expected = match message {
        Ok(ControlMessage::SlaveInit(init)) => match link.handshake.on_slave_init(&init) {
            Some(Ok(negotiated)) => {
                link.apply_negotiated(&negotiated);
                true
            }
            Some(Err(_)) => true,
            None => false,
        },
        Ok(ack @ ControlMessage::PowerSaveStart { .. }) | Ok(ack @ ControlMessage::PowerSaveStop { .. }) => {
            link.power_save.on_ack(&ack)
        }
        Ok(ControlMessage::QueueLoad { percent }) => {
            link.flow.report_queue_load(percent);
            true
        }
        Ok(ControlMessage::SlaveConfig(_)) => false,
        Err(err) => {
            warn!(error = %err, "malformed control message");
            false
        }
    };

    if !expected {
        inc(&link.stats.rx_priv_unexpected);
    }
}

pub(crate) async fn run_bus_reader(link: Arc<Link>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; link.bus.max_frame_size()];
    let timeout = link.config.receive_timeout();
    loop {
        if stopping(&shutdown) {
            break;
        }
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = link.bus.receive(&mut buf, timeout) => received,
        };

        match received {
            Ok(0) => {}
            Ok(len) => ingest_frame(&link, &buf[..len]),
            Err(BusError::Disconnected) => {
                warn!("bus disconnected, reader stopping");
                break;
            }
            Err(err) => {
                inc(&link.stats.rx_bus_errors);
                debug!(error = %err, "bus receive failed");
                if !pause(timeout, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    info!("bus reader exiting");
}

/// Turn one received frame into a buffer on the inbound bank.
pub(crate) fn ingest_frame(link: &Link, bytes: &[u8]) {
    let (header, payload) = match frame::decode(bytes, link.checksum_enabled()) {
        Ok(decoded) => decoded,
        Err(err) => {
            inc(&link.stats.rx_bad_frames);
            debug!(error = %err, len = bytes.len(), "dropping bad frame");
            return;
        }
    };

    link.flow.apply_command(header.throttle);
    inc(&link.stats.rx_frames);
    add(&link.stats.rx_bytes, payload.len() as u64);

    if payload.is_empty() {
        inc(&link.stats.rx_flow_only);
        return;
    }

    let handle = link.track(BufferHandle::copy_owned(header.if_type, header.if_num, payload.to_vec()));
    let priority = Priority::for_interface(header.if_type, link.rx.priorities());
    if let Err(err) = link.rx.enqueue(priority, handle) {
        inc(&link.stats.rx_queue_full);
        warn!(error = %err, "inbound queue full, dropping frame");
    }
}
