use crate::types::{DropPolicy, Point2};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub array: ArrayConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// オーディオ入力設定
///
/// ライブ入力デバイスに関する設定。
///
/// # デフォルト値
///
/// - `device_id`: "default" (システムのデフォルトデバイス)
/// - `sample_rate`: 22050 Hz
/// - `channels`: 3 (L字型3マイクアレイ)
/// - `block_size`: 1024 フレーム
/// - `open_attempts`: 3 回
/// - `retry_delay_ms`: 500 ms
/// - `max_read_errors`: 5 回連続
/// - `read_timeout_ms`: 500 ms
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_read_errors")]
    pub max_read_errors: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// 検出設定
///
/// # デフォルト値
///
/// - `threshold`: 0.70 (0.10 ~ 1.00)
/// - `reference_channel`: 0
/// - `analyze_long`: true
/// - `segment_duration_secs`: 3.0 秒
/// - `overlap`: 0.5 (50%)
/// - `long_audio_min_secs`: 10.0 秒（これを超えるとセグメント分割）
/// - `min_tail_secs`: 0.5 秒（これより短い末尾は破棄）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub reference_channel: usize,
    #[serde(default = "default_analyze_long")]
    pub analyze_long: bool,
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: f64,
    #[serde(default = "default_overlap")]
    pub overlap: f64,
    #[serde(default = "default_long_audio_min_secs")]
    pub long_audio_min_secs: f64,
    #[serde(default = "default_min_tail_secs")]
    pub min_tail_secs: f64,
}

/// 特徴量抽出設定
///
/// 分類器の入力形状 (stack_depth × n_mels × time_frames) を決める。
/// デフォルトは 3 × 64 × 259。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureConfig {
    #[serde(default = "default_processing_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,
    #[serde(default = "default_time_frames")]
    pub time_frames: usize,
    #[serde(default = "default_stack_depth")]
    pub stack_depth: usize,
}

/// マイクアレイ設定
///
/// # デフォルト値
///
/// - `microphones`: [[0.0, 0.0], [0.5, 0.0], [0.0, 0.5]] (L字型、0.5m間隔)
/// - `sound_speed`: 343.0 m/s
/// - `subsample_interpolation`: true (放物線補間でサブサンプル精度)
/// - `simulated_center` / `simulated_extent`: 模擬位置の配置範囲（中心と半幅）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArrayConfig {
    #[serde(default = "default_microphones")]
    pub microphones: Vec<[f64; 2]>,
    #[serde(default = "default_sound_speed")]
    pub sound_speed: f64,
    #[serde(default = "default_subsample_interpolation")]
    pub subsample_interpolation: bool,
    #[serde(default = "default_simulated_center")]
    pub simulated_center: [f64; 2],
    #[serde(default = "default_simulated_extent")]
    pub simulated_extent: [f64; 2],
    #[serde(default = "default_simulation_seed")]
    pub simulation_seed: u64,
}

/// リアルタイムバッファ設定
///
/// # デフォルト値
///
/// - `capacity_seconds`: 10 秒（ローリングバッファの上限）
/// - `drop_policy`: DropOldest
/// - `queue_blocks`: 64 ブロック（キャプチャキュー）
/// - `event_capacity`: 256 件（イベントキュー）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    #[serde(default = "default_capacity_seconds")]
    pub capacity_seconds: u32,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
    #[serde(default = "default_queue_blocks")]
    pub queue_blocks: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

// Default functions
fn default_device_id() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    22050
}

fn default_channels() -> u16 {
    3
}

fn default_block_size() -> u32 {
    1024
}

fn default_open_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_read_errors() -> u32 {
    5
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_threshold() -> f32 {
    0.70
}

fn default_analyze_long() -> bool {
    true
}

fn default_segment_duration_secs() -> f64 {
    3.0
}

fn default_overlap() -> f64 {
    0.5
}

fn default_long_audio_min_secs() -> f64 {
    10.0
}

fn default_min_tail_secs() -> f64 {
    0.5
}

fn default_processing_sample_rate() -> u32 {
    22050
}

fn default_n_fft() -> usize {
    1024
}

fn default_hop_length() -> usize {
    256
}

fn default_n_mels() -> usize {
    64
}

fn default_time_frames() -> usize {
    259 // 学習データのフレーム数
}

fn default_stack_depth() -> usize {
    3
}

fn default_microphones() -> Vec<[f64; 2]> {
    vec![[0.0, 0.0], [0.5, 0.0], [0.0, 0.5]]
}

fn default_sound_speed() -> f64 {
    343.0
}

fn default_subsample_interpolation() -> bool {
    true
}

fn default_simulated_center() -> [f64; 2] {
    [1.2, 0.8]
}

fn default_simulated_extent() -> [f64; 2] {
    [0.4, 0.3]
}

fn default_simulation_seed() -> u64 {
    0x5EED
}

fn default_capacity_seconds() -> u32 {
    10
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::DropOldest
}

fn default_queue_blocks() -> usize {
    64
}

fn default_event_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_interval_secs() -> u64 {
    10
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            block_size: default_block_size(),
            open_attempts: default_open_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_read_errors: default_max_read_errors(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            reference_channel: 0,
            analyze_long: default_analyze_long(),
            segment_duration_secs: default_segment_duration_secs(),
            overlap: default_overlap(),
            long_audio_min_secs: default_long_audio_min_secs(),
            min_tail_secs: default_min_tail_secs(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_processing_sample_rate(),
            n_fft: default_n_fft(),
            hop_length: default_hop_length(),
            n_mels: default_n_mels(),
            time_frames: default_time_frames(),
            stack_depth: default_stack_depth(),
        }
    }
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            microphones: default_microphones(),
            sound_speed: default_sound_speed(),
            subsample_interpolation: default_subsample_interpolation(),
            simulated_center: default_simulated_center(),
            simulated_extent: default_simulated_extent(),
            simulation_seed: default_simulation_seed(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity_seconds: default_capacity_seconds(),
            drop_policy: default_drop_policy(),
            queue_blocks: default_queue_blocks(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl ArrayConfig {
    /// マイク位置を Point2 の配列として取得
    pub fn microphone_positions(&self) -> Vec<Point2> {
        self.microphones.iter().copied().map(Point2::from).collect()
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成し、値を検証する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込み・パース・検証に失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use dronewatch::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        config.validate()?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        ensure!(
            (0.10..=1.00).contains(&d.threshold),
            "検出閾値は 0.10 ~ 1.00 の範囲で指定してください: {}",
            d.threshold
        );
        ensure!(
            d.segment_duration_secs > 0.0,
            "セグメント長は正の値が必要です: {}",
            d.segment_duration_secs
        );
        ensure!(
            (0.0..1.0).contains(&d.overlap),
            "オーバーラップ率は 0.0 以上 1.0 未満で指定してください: {}",
            d.overlap
        );
        ensure!(d.min_tail_secs >= 0.0, "最小末尾長が負です: {}", d.min_tail_secs);

        let f = &self.features;
        ensure!(f.sample_rate > 0, "処理サンプリングレートが0です");
        ensure!(
            f.n_fft >= 2 && f.hop_length > 0 && f.n_mels > 0 && f.time_frames > 0,
            "特徴量パラメータが不正です: {:?}",
            f
        );
        ensure!(f.stack_depth > 0, "スタック数が0です");

        let a = &self.array;
        ensure!(a.sound_speed > 0.0, "音速は正の値が必要です: {}", a.sound_speed);
        ensure!(
            a.microphones.len() >= 3,
            "マイクは3個以上必要です: {} 個",
            a.microphones.len()
        );
        ensure!(
            a.microphones.iter().flatten().all(|v| v.is_finite()),
            "マイク座標に非有限値があります: {:?}",
            a.microphones
        );
        ensure!(
            a.simulated_center
                .iter()
                .chain(&a.simulated_extent)
                .all(|v| v.is_finite()),
            "模擬配置の範囲に非有限値があります: center={:?}, extent={:?}",
            a.simulated_center,
            a.simulated_extent
        );
        ensure!(
            !crate::localizer::MicrophoneArray::new(a.microphone_positions()).is_collinear(),
            "マイク配置が一直線上にあります: {:?}",
            a.microphones
        );

        ensure!(self.audio.sample_rate > 0, "入力サンプリングレートが0です");
        ensure!(self.audio.channels > 0, "入力チャンネル数が0です");
        ensure!(self.audio.open_attempts > 0, "デバイスオープン試行回数が0です");
        ensure!(
            d.reference_channel < self.audio.channels as usize,
            "基準チャンネル {} が入力チャンネル数 {} を超えています",
            d.reference_channel,
            self.audio.channels
        );
        ensure!(
            self.buffer.capacity_seconds as f64 >= d.segment_duration_secs,
            "バッファ容量 {} 秒が解析ウィンドウ {} 秒より短いです",
            self.buffer.capacity_seconds,
            d.segment_duration_secs
        );
        ensure!(self.buffer.queue_blocks > 0, "キャプチャキュー容量が0です");
        ensure!(self.buffer.event_capacity > 0, "イベントキュー容量が0です");
        Ok(())
    }
}
