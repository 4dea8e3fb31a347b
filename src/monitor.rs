use crate::analyzer::DroneAnalyzer;
use crate::buffer::{AnalysisWindow, RollingBuffer};
use crate::config::Config;
use crate::error::{DetectionError, Result};
use crate::localizer::PositionEstimate;
use crate::source::{AudioSource, SourceFactory, SourceRead};
use crate::types::AudioFormat;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// 監視ループが外部へ送るイベント
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    MonitoringStarted {
        channels: u16,
        sample_rate: u32,
        timestamp: String,
    },
    MonitoringStopped {
        detections: u64,
        reason: String,
        timestamp: String,
    },
    DroneDetected {
        probability: f32,
        confidence: f64,
        position: Option<PositionEstimate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        localization_note: Option<String>,
        timestamp: String,
    },
}

/// `status()` の応答
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub uptime_secs: f64,
    pub channels: u16,
    pub detections: u64,
}

/// 実行中セッションのスナップショット
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonitoringSession {
    pub started_at: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub detections: u64,
}

/// 監視ループが公開する状態
///
/// 書き込むのはループのみで、`status()` はロックなしで読む。
#[derive(Default)]
struct SharedState {
    running: AtomicBool,
    started_at_ms: AtomicI64,
    channels: AtomicU16,
    sample_rate: AtomicU32,
    detections: AtomicU64,
}

struct SessionHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// ノンブロッキングのイベントキュー
///
/// 満杯のときは最古のイベントを捨てる。送信側がループを止めることはない。
#[derive(Clone)]
struct EventQueue {
    sender: Sender<MonitorEvent>,
    overflow: Receiver<MonitorEvent>,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        let (sender, overflow) = crossbeam_channel::bounded(capacity.max(1));
        Self { sender, overflow }
    }

    fn emit(&self, event: MonitorEvent) {
        match self.sender.try_send(event) {
            Ok(_) => {}
            Err(TrySendError::Full(event)) => {
                let _ = self.overflow.try_recv();
                log::warn!("イベントキュー満杯: 最古のイベントを破棄");
                let _ = self.sender.try_send(event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

fn rfc3339_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn rfc3339_from_ms(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn rfc3339_from_ns(timestamp_ns: u128) -> String {
    chrono::DateTime::from_timestamp(
        (timestamp_ns / 1_000_000_000) as i64,
        (timestamp_ns % 1_000_000_000) as u32,
    )
    .map(|dt| dt.to_rfc3339())
    .unwrap_or_default()
}

/// リアルタイム監視
///
/// `Idle → Running → Idle` の状態遷移を持つ。キャプチャと解析は専用の
/// バックグラウンドスレッドで行い、入力デバイスとローリングバッファは
/// そのスレッドだけが所有する。`start()` / `stop()` は互いに排他。
///
/// ```text
/// [AudioSource] → [RollingBuffer] → 3秒ウィンドウ → [DroneAnalyzer]
///                                                        ↓
///                                          [EventQueue] → events()
/// ```
pub struct RealTimeMonitor {
    config: Config,
    analyzer: Arc<DroneAnalyzer>,
    factory: SourceFactory,
    session: Mutex<Option<SessionHandle>>,
    shared: Arc<SharedState>,
    events: EventQueue,
}

impl RealTimeMonitor {
    pub fn new(config: Config, analyzer: Arc<DroneAnalyzer>, factory: SourceFactory) -> Self {
        let events = EventQueue::new(config.buffer.event_capacity);
        Self {
            config,
            analyzer,
            factory,
            session: Mutex::new(None),
            shared: Arc::new(SharedState::default()),
            events,
        }
    }

    /// イベントの受信側
    ///
    /// 受信しなくても監視ループは止まらない（古いイベントから捨てられる）。
    pub fn events(&self) -> Receiver<MonitorEvent> {
        self.events.overflow.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// 監視を開始
    ///
    /// 入力デバイスが開けるまで待ってから返る。
    ///
    /// # Errors
    ///
    /// - 既に実行中: `AlreadyRunning`
    /// - リトライ後もデバイスを開けない: `DeviceUnavailable`
    pub fn start(&self) -> Result<MonitoringSession> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(handle) = session.take() {
            if self.is_running() {
                *session = Some(handle);
                return Err(DetectionError::AlreadyRunning);
            }
            // ループが自力で終了していた（デバイス障害・入力終了）
            if handle.thread.join().is_err() {
                log::error!("前回の監視スレッドがパニックしていました");
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<AudioFormat>>(1);

        let worker = MonitorLoop {
            config: self.config.clone(),
            analyzer: self.analyzer.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            stop: stop.clone(),
        };
        let factory = self.factory.clone();

        let thread = std::thread::Builder::new()
            .name("dronewatch-monitor".to_string())
            .spawn(move || worker.run(factory, ready_tx))
            .map_err(|e| DetectionError::DeviceUnavailable(format!("監視スレッドの起動に失敗: {}", e)))?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(DetectionError::DeviceUnavailable(
                "監視スレッドが応答しません".to_string(),
            ))
        });

        match ready {
            Ok(format) => {
                *session = Some(SessionHandle { stop, thread });
                // ループが既に終了している場合があるためオープン結果から作る
                Ok(MonitoringSession {
                    started_at: rfc3339_from_ms(self.shared.started_at_ms.load(Ordering::SeqCst)),
                    channels: format.channels,
                    sample_rate: format.sample_rate,
                    detections: 0,
                })
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    /// 監視を停止
    ///
    /// 実行中でなければ何もしない。処理中のブロックを終えてからループを抜け、
    /// 入力を閉じて「監視停止」イベントを送る。
    pub fn stop(&self) {
        // 終了を待つ間もロックを保持し、同時の start() を待たせる
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = session.take() else {
            log::debug!("監視は実行されていません");
            return;
        };

        handle.stop.store(true, Ordering::SeqCst);
        if handle.thread.join().is_err() {
            log::error!("監視スレッドがパニックしました");
            self.shared.running.store(false, Ordering::SeqCst);
        }
    }

    /// 現在の状態（ロックなし）
    pub fn status(&self) -> MonitorStatus {
        let running = self.is_running();
        let (uptime_secs, channels) = if running {
            let started = self.shared.started_at_ms.load(Ordering::SeqCst);
            let elapsed_ms = (chrono::Utc::now().timestamp_millis() - started).max(0);
            (
                elapsed_ms as f64 / 1000.0,
                self.shared.channels.load(Ordering::SeqCst),
            )
        } else {
            (0.0, 0)
        };
        MonitorStatus {
            running,
            uptime_secs,
            channels,
            detections: self.shared.detections.load(Ordering::SeqCst),
        }
    }

    /// 実行中セッションのスナップショット
    ///
    /// # Errors
    ///
    /// 実行中でなければ `NotRunning` を返す。
    pub fn session(&self) -> Result<MonitoringSession> {
        if !self.is_running() {
            return Err(DetectionError::NotRunning);
        }
        Ok(MonitoringSession {
            started_at: rfc3339_from_ms(self.shared.started_at_ms.load(Ordering::SeqCst)),
            channels: self.shared.channels.load(Ordering::SeqCst),
            sample_rate: self.shared.sample_rate.load(Ordering::SeqCst),
            detections: self.shared.detections.load(Ordering::SeqCst),
        })
    }
}

impl Drop for RealTimeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// バックグラウンドスレッドで動く監視ループ
struct MonitorLoop {
    config: Config,
    analyzer: Arc<DroneAnalyzer>,
    shared: Arc<SharedState>,
    events: EventQueue,
    stop: Arc<AtomicBool>,
}

impl MonitorLoop {
    fn run(self, factory: SourceFactory, ready: Sender<Result<AudioFormat>>) {
        let (mut source, format) = match self.open_with_retry(&factory) {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("{}", e);
                let _ = ready.send(Err(e));
                return;
            }
        };

        self.shared.detections.store(0, Ordering::SeqCst);
        self.shared.channels.store(format.channels, Ordering::SeqCst);
        self.shared.sample_rate.store(format.sample_rate, Ordering::SeqCst);
        self.shared
            .started_at_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        log::info!(
            "監視を開始しました: {}ch, {}Hz",
            format.channels,
            format.sample_rate
        );
        self.events.emit(MonitorEvent::MonitoringStarted {
            channels: format.channels,
            sample_rate: format.sample_rate,
            timestamp: rfc3339_now(),
        });
        let _ = ready.send(Ok(format));

        let reason = self.capture(source.as_mut(), format);
        source.close();

        self.shared.running.store(false, Ordering::SeqCst);
        let detections = self.shared.detections.load(Ordering::SeqCst);
        log::info!("監視を停止しました ({}): 検出 {} 件", reason, detections);
        self.events.emit(MonitorEvent::MonitoringStopped {
            detections,
            reason,
            timestamp: rfc3339_now(),
        });
    }

    /// 入力を開く（有限回リトライ）
    fn open_with_retry(&self, factory: &SourceFactory) -> Result<(Box<dyn AudioSource>, AudioFormat)> {
        let attempts = self.config.audio.open_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let opened = factory().and_then(|mut source| {
                let format = source.open()?;
                Ok((source, format))
            });
            match opened {
                Ok((source, format)) if format.channels > 0 && format.sample_rate > 0 => {
                    return Ok((source, format));
                }
                Ok((mut source, format)) => {
                    source.close();
                    last_error = format!("不正なフォーマット: {:?}", format);
                }
                Err(e) => last_error = format!("{:#}", e),
            }
            log::warn!(
                "入力デバイスのオープンに失敗 ({}/{}): {}",
                attempt,
                attempts,
                last_error
            );
            if attempt < attempts {
                std::thread::sleep(Duration::from_millis(self.config.audio.retry_delay_ms));
            }
        }

        Err(DetectionError::DeviceUnavailable(format!(
            "{} 回試行しましたが開けません: {}",
            attempts, last_error
        )))
    }

    /// 停止要求・入力終了・デバイス障害まで読み込みと解析を繰り返す
    ///
    /// 終了理由を返す。
    fn capture(&self, source: &mut dyn AudioSource, format: AudioFormat) -> String {
        let mut buffer = RollingBuffer::new(
            &self.config.buffer,
            format.channels as usize,
            format.sample_rate,
        );
        let windower = self.analyzer.engine().windower();
        let window_frames = windower.segment_samples(format.sample_rate);
        let stride_frames = windower.stride_samples(format.sample_rate);
        let timeout = Duration::from_millis(self.config.audio.read_timeout_ms);
        let max_errors = self.config.audio.max_read_errors.max(1);
        let mut consecutive_errors = 0;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return "停止要求".to_string();
            }

            let failure = match source.read_block(timeout) {
                Ok(SourceRead::Block(block)) => {
                    consecutive_errors = 0;
                    if let Err(e) = buffer.push(block) {
                        log::warn!("ブロックをスキップ: {}", e);
                        continue;
                    }
                    while let Some(window) = buffer.next_window(window_frames, stride_frames) {
                        self.process(window);
                    }
                    continue;
                }
                Ok(SourceRead::Finished) => return "入力終了".to_string(),
                Ok(SourceRead::Timeout) => "読み込みタイムアウト".to_string(),
                Err(e) => format!("{:#}", e),
            };

            consecutive_errors += 1;
            log::warn!(
                "入力エラー ({}/{}): {}",
                consecutive_errors,
                max_errors,
                failure
            );
            if consecutive_errors >= max_errors {
                let err = DetectionError::DeviceUnavailable(failure);
                log::error!("{}", err);
                return err.to_string();
            }
        }
    }

    /// 1ウィンドウを解析し、検出時はイベントを送る
    fn process(&self, window: AnalysisWindow) {
        let threshold = self.config.detection.threshold;
        let report = match self.analyzer.analyze(&window.buffer, threshold, false) {
            Ok(report) => report,
            Err(e) => {
                log::warn!("ウィンドウの解析をスキップ: {}", e);
                return;
            }
        };

        if !report.detection.is_drone {
            log::debug!("未検出: 確率 {:.3}", report.detection.probability);
            return;
        }

        let count = self.shared.detections.fetch_add(1, Ordering::SeqCst) + 1;
        let probability = report.detection.probability;
        let confidence = report
            .localization
            .as_ref()
            .map(PositionEstimate::confidence)
            .unwrap_or(probability as f64);
        match &report.localization {
            Some(estimate) => {
                let p = estimate.position();
                log::info!(
                    "ドローン検出 #{}: 確率 {:.3}, 位置 ({:.2}, {:.2}) m{}",
                    count,
                    probability,
                    p.x,
                    p.y,
                    if estimate.is_simulated() { " [模擬]" } else { "" }
                );
            }
            None => log::info!("ドローン検出 #{}: 確率 {:.3}, 位置不明", count, probability),
        }

        self.events.emit(MonitorEvent::DroneDetected {
            probability,
            confidence,
            position: report.localization,
            localization_note: report.localization_note,
            timestamp: rfc3339_from_ns(window.timestamp_ns),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureTensor;
    use crate::source::ReplaySource;
    use crate::types::{AudioBlock, AudioBuffer, ClassScores, Point2};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const SR: u32 = 22050;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.audio.retry_delay_ms = 10;
        config.audio.read_timeout_ms = 50;
        config.audio.max_read_errors = 3;
        config
    }

    fn analyzer(config: &Config, probability: f32) -> Arc<DroneAnalyzer> {
        let classifier = move |_: &FeatureTensor| -> crate::error::Result<ClassScores> {
            Ok(ClassScores::from_drone_probability(probability))
        };
        Arc::new(DroneAnalyzer::new(config, Arc::new(classifier)))
    }

    fn replay_factory(buffer: AudioBuffer, realtime: bool) -> SourceFactory {
        Arc::new(move || {
            Ok(Box::new(ReplaySource::new(buffer.clone(), 1024, realtime)) as Box<dyn AudioSource>)
        })
    }

    /// 全チャンネル同じ広帯域ノイズ
    fn noise_buffer(secs: f64, channels: usize) -> AudioBuffer {
        let n = (secs * SR as f64) as usize;
        let mut state: u32 = 99;
        let samples: Vec<f32> = (0..n)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                ((state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * 0.3
            })
            .collect();
        AudioBuffer::new(vec![samples; channels], SR).unwrap()
    }

    fn wait_for<F: Fn(&MonitorEvent) -> bool>(
        events: &Receiver<MonitorEvent>,
        predicate: F,
    ) -> Vec<MonitorEvent> {
        let deadline = Instant::now() + Duration::from_secs(60);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
                let done = predicate(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }
        panic!("イベントを受信できませんでした: {:?}", seen);
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let config = test_config();
        let monitor = RealTimeMonitor::new(
            config.clone(),
            analyzer(&config, 0.1),
            replay_factory(noise_buffer(30.0, 3), true),
        );
        let events = monitor.events();

        // 停止中
        assert!(!monitor.status().running);
        assert_eq!(monitor.session(), Err(DetectionError::NotRunning));
        monitor.stop(); // 何もしない

        let session = monitor.start().unwrap();
        assert_eq!(session.channels, 3);
        assert_eq!(session.sample_rate, SR);

        let status = monitor.status();
        assert!(status.running);
        assert_eq!(status.channels, 3);
        assert_eq!(status.detections, 0);

        // 二重起動は失敗
        assert!(matches!(monitor.start(), Err(DetectionError::AlreadyRunning)));

        monitor.stop();
        assert!(!monitor.status().running);
        monitor.stop();

        let seen: Vec<_> = events.try_iter().collect();
        assert!(matches!(
            seen.first(),
            Some(MonitorEvent::MonitoringStarted { channels: 3, .. })
        ));
        match seen.last() {
            Some(MonitorEvent::MonitoringStopped { reason, .. }) => assert_eq!(reason, "停止要求"),
            other => panic!("停止イベントがありません: {:?}", other),
        }

        // 停止後は再開できる
        monitor.start().unwrap();
        assert!(monitor.status().running);
        monitor.stop();
    }

    #[test]
    fn test_detection_events() {
        let config = test_config();
        let monitor = RealTimeMonitor::new(
            config.clone(),
            analyzer(&config, 0.9),
            replay_factory(noise_buffer(6.0, 3), false),
        );
        let events = monitor.events();
        monitor.start().unwrap();

        let seen = wait_for(&events, |e| matches!(e, MonitorEvent::MonitoringStopped { .. }));
        let detections: Vec<_> = seen
            .iter()
            .filter(|e| matches!(e, MonitorEvent::DroneDetected { .. }))
            .collect();
        // 6秒・ストライド1.5秒: 0, 1.5, 3.0 秒開始の3ウィンドウ
        assert_eq!(detections.len(), 3);

        match detections[0] {
            MonitorEvent::DroneDetected {
                probability,
                position,
                timestamp,
                ..
            } => {
                assert!((probability - 0.9).abs() < 1e-6);
                // 3チャンネル同一信号 → 実測モード（TDOA はすべて0）
                let estimate = position.as_ref().unwrap();
                assert!(!estimate.is_simulated());
                assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
            }
            _ => unreachable!(),
        }

        match seen.last() {
            Some(MonitorEvent::MonitoringStopped {
                detections, reason, ..
            }) => {
                assert_eq!(*detections, 3);
                assert_eq!(reason, "入力終了");
            }
            other => panic!("停止イベントがありません: {:?}", other),
        }

        // ループが自力で終了した後は Idle
        assert!(!monitor.status().running);
        assert_eq!(monitor.status().detections, 3);
        monitor.stop();
    }

    #[test]
    fn test_stereo_uses_simulated_position() {
        let config = test_config();
        let monitor = RealTimeMonitor::new(
            config.clone(),
            analyzer(&config, 0.9),
            replay_factory(noise_buffer(3.0, 2), false),
        );
        let events = monitor.events();
        monitor.start().unwrap();

        let seen = wait_for(&events, |e| matches!(e, MonitorEvent::MonitoringStopped { .. }));
        let estimate = seen.iter().find_map(|e| match e {
            MonitorEvent::DroneDetected { position, .. } => position.clone(),
            _ => None,
        });
        assert!(estimate.unwrap().is_simulated());
    }

    #[test]
    fn test_device_unavailable_after_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let factory: SourceFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("デバイスがありません")
        });

        let config = test_config();
        let monitor = RealTimeMonitor::new(config.clone(), analyzer(&config, 0.1), factory);
        match monitor.start() {
            Err(DetectionError::DeviceUnavailable(msg)) => assert!(msg.contains("デバイスがありません")),
            other => panic!("DeviceUnavailable を期待: {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!monitor.status().running);
    }

    /// 開けるが読み込みが常に失敗する入力
    struct BrokenSource;

    impl AudioSource for BrokenSource {
        fn open(&mut self) -> anyhow::Result<AudioFormat> {
            Ok(AudioFormat {
                sample_rate: SR,
                channels: 3,
            })
        }

        fn read_block(&mut self, _timeout: Duration) -> anyhow::Result<SourceRead> {
            anyhow::bail!("入力オーバーラン")
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_read_errors_stop_monitor() {
        let config = test_config();
        let factory: SourceFactory = Arc::new(|| Ok(Box::new(BrokenSource) as Box<dyn AudioSource>));
        let monitor = RealTimeMonitor::new(config.clone(), analyzer(&config, 0.1), factory);
        let events = monitor.events();
        monitor.start().unwrap();

        let seen = wait_for(&events, |e| matches!(e, MonitorEvent::MonitoringStopped { .. }));
        match seen.last() {
            Some(MonitorEvent::MonitoringStopped { reason, .. }) => {
                assert!(reason.contains("入力オーバーラン"))
            }
            other => panic!("停止イベントがありません: {:?}", other),
        }
        assert!(!monitor.status().running);
        assert_eq!(monitor.session(), Err(DetectionError::NotRunning));

        // 自力で終了したセッションの後でも start できる
        monitor.start().unwrap();
        monitor.stop();
    }

    #[test]
    fn test_full_event_queue_keeps_newest() {
        let mut config = test_config();
        config.buffer.event_capacity = 1;
        let monitor = RealTimeMonitor::new(
            config.clone(),
            analyzer(&config, 0.9),
            replay_factory(noise_buffer(6.0, 3), false),
        );
        let events = monitor.events();
        monitor.start().unwrap();

        // 受信しないままループが最後まで進む
        let deadline = Instant::now() + Duration::from_secs(60);
        while monitor.is_running() {
            assert!(Instant::now() < deadline, "監視ループが終了しません");
            std::thread::sleep(Duration::from_millis(20));
        }
        monitor.stop();

        let seen: Vec<_> = events.try_iter().collect();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            MonitorEvent::MonitoringStopped {
                detections, reason, ..
            } => {
                assert_eq!(*detections, 3);
                assert_eq!(reason, "入力終了");
            }
            other => panic!("最新のイベントは停止イベントのはず: {:?}", other),
        }
    }

    /// 停止されるまでノイズを返し続ける入力
    struct EndlessSource {
        block: AudioBlock,
    }

    impl AudioSource for EndlessSource {
        fn open(&mut self) -> anyhow::Result<AudioFormat> {
            Ok(AudioFormat {
                sample_rate: SR,
                channels: self.block.samples.len() as u16,
            })
        }

        fn read_block(&mut self, _timeout: Duration) -> anyhow::Result<SourceRead> {
            let mut block = self.block.clone();
            block.timestamp_ns = crate::source::now_ns();
            Ok(SourceRead::Block(block))
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_analysis_errors_are_skipped() {
        let config = test_config();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let classifier = move |_: &FeatureTensor| -> crate::error::Result<ClassScores> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DetectionError::Classification("分類器エラー".to_string()))
        };
        let analyzer = Arc::new(DroneAnalyzer::new(&config, Arc::new(classifier)));

        let noise = noise_buffer(1024.0 / SR as f64, 3);
        let block = AudioBlock {
            samples: noise.channels().to_vec(),
            timestamp_ns: 0,
        };
        let factory: SourceFactory = Arc::new(move || {
            Ok(Box::new(EndlessSource {
                block: block.clone(),
            }) as Box<dyn AudioSource>)
        });

        let monitor = RealTimeMonitor::new(config, analyzer, factory);
        let events = monitor.events();
        monitor.start().unwrap();

        // 解析が何度失敗してもループは続く
        let deadline = Instant::now() + Duration::from_secs(60);
        while calls.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "ウィンドウが解析されません");
            std::thread::sleep(Duration::from_millis(10));
        }
        let status = monitor.status();
        assert!(status.running);
        assert_eq!(status.detections, 0);

        monitor.stop();
        assert!(!monitor.status().running);

        let seen: Vec<_> = events.try_iter().collect();
        assert!(!seen
            .iter()
            .any(|e| matches!(e, MonitorEvent::DroneDetected { .. })));
        match seen.last() {
            Some(MonitorEvent::MonitoringStopped {
                detections, reason, ..
            }) => {
                assert_eq!(*detections, 0);
                assert_eq!(reason, "停止要求");
            }
            other => panic!("停止イベントがありません: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = MonitorEvent::DroneDetected {
            probability: 0.9,
            confidence: 0.5,
            position: Some(PositionEstimate::Simulated {
                position: Point2::new(1.0, 2.0),
                confidence: 0.9,
                error_m: None,
            }),
            localization_note: None,
            timestamp: rfc3339_from_ns(1_700_000_000_000_000_000),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "drone_detected");
        assert_eq!(json["position"]["simulated"], true);
        assert!(json.get("localization_note").is_none());
        assert!(json["timestamp"].as_str().unwrap().starts_with("2023-11-14"));
    }
}
