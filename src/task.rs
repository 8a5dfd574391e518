//! Monitor tasks.
//!
//! A [`MonitorTask`] keeps probing one target until it is stopped.  Every
//! probe round sends one echo request; failed rounds are retried after a
//! backoff, so only [`MonitorTask::stop`] ends a task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use log::{debug, error, warn};
use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::probe::Prober;

const NAMESPACE: &str = "gossiping";
const SUBSYSTEM: &str = "ping";

const RTT_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid metric labels: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("no tokio runtime to run the probe loop on")]
    NoRuntime,
}

/// Timing of the probe loop.
#[derive(Debug, Clone, Copy)]
pub struct TaskOptions {
    /// Pause after a successful round.
    pub interval: Duration,
    /// How long to wait for an echo reply.
    pub timeout: Duration,
    /// Pause after a failed round.
    pub backoff: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl From<u8> for TaskState {
    fn from(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Running,
            _ => TaskState::Stopped,
        }
    }
}

struct TaskMetrics {
    send_packets: IntCounter,
    recv_packets: IntCounter,
    rtt: Histogram,
    probe_error: IntGauge,
}

impl TaskMetrics {
    fn new(labels: HashMap<String, String>) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM)
                .const_labels(labels.clone())
        };

        Ok(Self {
            send_packets: IntCounter::with_opts(opts(
                "send_packet_total",
                "The number of sent packets",
            ))?,
            recv_packets: IntCounter::with_opts(opts(
                "recv_packet_total",
                "The number of received packets",
            ))?,
            rtt: Histogram::with_opts(
                HistogramOpts::new("rtt_seconds", "Round trip time of echo requests")
                    .namespace(NAMESPACE)
                    .subsystem(SUBSYSTEM)
                    .const_labels(labels.clone())
                    .buckets(RTT_BUCKETS.to_vec()),
            )?,
            probe_error: IntGauge::with_opts(opts(
                "probe_error",
                "Whether the last probe round of the target failed",
            ))?,
        })
    }
}

/// Probes one address, labelled with its job's labels.
pub struct MonitorTask {
    address: String,
    ip: IpAddr,
    fingerprint: u64,

    prober: Arc<dyn Prober>,
    options: TaskOptions,
    metrics: Arc<TaskMetrics>,

    state: AtomicU8,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorTask {
    /// Prepares metrics labelled with `labels` plus `target=<address>` for
    /// probing `ip`, the resolved `address`.  Nothing runs until
    /// [`MonitorTask::start`].
    pub fn new(
        address: &str,
        ip: IpAddr,
        fingerprint: u64,
        labels: &HashMap<String, String>,
        prober: Arc<dyn Prober>,
        options: TaskOptions,
    ) -> Result<Self, Error> {
        let mut labels = labels.clone();
        labels.insert("target".to_string(), address.to_string());
        let metrics = TaskMetrics::new(labels)?;

        Ok(Self {
            address: address.to_string(),
            ip,
            fingerprint,
            prober,
            options,
            metrics: Arc::new(metrics),
            state: AtomicU8::new(TaskState::Created as u8),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn state(&self) -> TaskState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Spawns the probe loop.  Starting a task twice, or after it was
    /// stopped, does nothing.
    pub fn start(&self) -> Result<(), Error> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        if self
            .state
            .compare_exchange(
                TaskState::Created as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        let handle = runtime.spawn(probe_loop(
            self.address.clone(),
            self.ip,
            Arc::clone(&self.prober),
            self.options,
            Arc::clone(&self.metrics),
            self.cancel.clone(),
        ));
        *self.handle.lock() = Some(handle);

        Ok(())
    }

    /// Signals the probe loop to exit and returns immediately.  An in
    /// flight ping or backoff wait is abandoned.
    pub fn stop(&self) {
        let prev = self.state.swap(TaskState::Stopped as u8, Ordering::AcqRel);
        if prev != TaskState::Stopped as u8 {
            self.cancel.cancel();
        }
    }

    /// Waits for the probe loop to exit, returns at once if it never ran.
    pub async fn wait(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("Probe loop of {} ended abnormally: {}", self.address, err);
            }
        }
    }

    pub fn collect(&self) -> Vec<MetricFamily> {
        let mut mfs = self.metrics.send_packets.collect();
        mfs.extend(self.metrics.recv_packets.collect());
        mfs.extend(self.metrics.rtt.collect());
        mfs.extend(self.metrics.probe_error.collect());
        mfs
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        // never leak a probe loop
        self.cancel.cancel();
    }
}

enum Round {
    Replied,
    Lost,
    Failed,
}

async fn probe_loop(
    address: String,
    ip: IpAddr,
    prober: Arc<dyn Prober>,
    options: TaskOptions,
    metrics: Arc<TaskMetrics>,
    cancel: CancellationToken,
) {
    debug!("Start probing {} ({})", address, ip);

    let mut seq = 0u16;
    loop {
        seq = seq.wrapping_add(1);

        let round = async {
            metrics.send_packets.inc();
            prober.ping(ip, seq, options.timeout).await
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = AssertUnwindSafe(round).catch_unwind() => result,
        };

        let round = match result {
            Ok(Ok(Some(rtt))) => {
                metrics.recv_packets.inc();
                metrics.rtt.observe(rtt.as_secs_f64());
                Round::Replied
            }
            Ok(Ok(None)) => Round::Lost,
            Ok(Err(err)) => {
                warn!("Probe {} failed: {}, retry in {:?}", address, err, options.backoff);
                Round::Failed
            }
            Err(_panic) => {
                error!("Probe round of {} panicked, retry in {:?}", address, options.backoff);
                Round::Failed
            }
        };

        let pause = match round {
            Round::Replied | Round::Lost => {
                metrics.probe_error.set(0);
                options.interval
            }
            Round::Failed => {
                metrics.probe_error.set(1);
                options.backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!("Stop probing {}", address);
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::probe;

    /// Replies after `delay`, panics or fails on demand.
    #[derive(Default)]
    pub struct MockProber {
        pub calls: AtomicUsize,
        pub delay: Duration,
        pub panic_first: bool,
        pub always_fail: bool,
    }

    #[async_trait]
    impl Prober for MockProber {
        async fn resolve(&self, address: &str) -> Result<IpAddr, probe::Error> {
            address.parse().map_err(|_| probe::Error::Resolve {
                address: address.to_string(),
                reason: "not an ip".into(),
            })
        }

        async fn ping(
            &self,
            _target: IpAddr,
            _seq: u16,
            _timeout: Duration,
        ) -> Result<Option<Duration>, probe::Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_first && call == 0 {
                panic!("first round explodes");
            }
            if self.always_fail {
                return Err(std::io::Error::other("network unreachable").into());
            }

            tokio::time::sleep(self.delay).await;
            Ok(Some(Duration::from_millis(2)))
        }
    }

    fn task(prober: Arc<MockProber>) -> MonitorTask {
        MonitorTask::new(
            "10.0.0.1",
            IpAddr::from([10, 0, 0, 1]),
            1,
            &HashMap::from([("dc".to_string(), "eu".to_string())]),
            prober,
            TaskOptions::default(),
        )
        .unwrap()
    }

    fn gauge(task: &MonitorTask) -> i64 {
        task.metrics.probe_error.get()
    }

    #[test]
    fn construction_fails_on_bad_label_name() {
        let result = MonitorTask::new(
            "10.0.0.1",
            IpAddr::from([10, 0, 0, 1]),
            1,
            &HashMap::from([("bad-name".to_string(), "x".to_string())]),
            Arc::new(MockProber::default()),
            TaskOptions::default(),
        );
        assert!(matches!(result, Err(Error::Metrics(_))));
    }

    #[test]
    fn start_without_runtime() {
        let task = task(Arc::new(MockProber::default()));
        assert!(matches!(task.start(), Err(Error::NoRuntime)));
        assert_eq!(task.state(), TaskState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_and_counts() {
        let prober = Arc::new(MockProber::default());
        let task = task(Arc::clone(&prober));
        task.start().unwrap();
        assert_eq!(task.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(prober.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(task.metrics.send_packets.get(), task.metrics.recv_packets.get());
        assert!(task.metrics.rtt.get_sample_count() >= 3);

        task.stop();
        task.wait().await;
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn survives_panicking_round() {
        let prober = Arc::new(MockProber {
            panic_first: true,
            ..Default::default()
        });
        let task = task(Arc::clone(&prober));
        task.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gauge(&task), 1);

        // after the backoff the loop carries on
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(prober.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(gauge(&task), 0);
        assert!(task.metrics.recv_packets.get() >= 1);

        task.stop();
        task.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off() {
        let prober = Arc::new(MockProber {
            always_fail: true,
            ..Default::default()
        });
        let task = task(Arc::clone(&prober));
        task.start().unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
        assert_eq!(gauge(&task), 1);
        assert_eq!(task.state(), TaskState::Running);

        task.stop();
        task.wait().await;
    }

    #[tokio::test]
    async fn stop_during_backoff_is_prompt() {
        let prober = Arc::new(MockProber {
            always_fail: true,
            ..Default::default()
        });
        let task = task(Arc::clone(&prober));
        task.start().unwrap();

        while prober.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        task.stop();
        tokio::time::timeout(Duration::from_secs(1), task.wait())
            .await
            .expect("probe loop should exit without waiting out the backoff");
    }

    #[tokio::test]
    async fn stop_interrupts_inflight_ping() {
        let prober = Arc::new(MockProber {
            delay: Duration::from_secs(60),
            ..Default::default()
        });
        let task = task(Arc::clone(&prober));
        task.start().unwrap();

        while prober.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        task.stop();
        tokio::time::timeout(Duration::from_secs(1), task.wait())
            .await
            .expect("in flight ping should be abandoned");
    }

    #[tokio::test]
    async fn stop_before_start() {
        let prober = Arc::new(MockProber::default());
        let task = task(Arc::clone(&prober));

        task.stop();
        task.stop();
        task.start().unwrap();
        task.wait().await;

        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn metrics_carry_labels() {
        let task = task(Arc::new(MockProber::default()));
        let mfs = task.collect();

        let names = mfs.iter().map(|mf| mf.get_name()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "gossiping_ping_send_packet_total",
                "gossiping_ping_recv_packet_total",
                "gossiping_ping_rtt_seconds",
                "gossiping_ping_probe_error",
            ]
        );

        let labels = mfs[0].get_metric()[0].get_label();
        let pairs = labels
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect::<Vec<_>>();
        assert!(pairs.contains(&("dc", "eu")));
        assert!(pairs.contains(&("target", "10.0.0.1")));
    }
}
