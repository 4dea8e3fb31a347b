use crate::error::{DetectionError, Result};
use serde::{Deserialize, Serialize};

/// オーディオフォーマット情報
///
/// 音声データのサンプリングレートとチャンネル数を保持する。
///
/// # Examples
///
/// ```
/// # use dronewatch::types::AudioFormat;
/// let format = AudioFormat {
///     sample_rate: 22050,
///     channels: 3, // L字型3マイクアレイ
/// };
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    /// サンプリングレート (Hz)
    pub sample_rate: u32,

    /// チャンネル数
    pub channels: u16,
}

/// オーディオブロック
///
/// ライブ入力から1回のコールバックで受け取った音声データ。
/// チャンネル毎に分離済み（デインターリーブ済み）。
#[derive(Clone, Debug)]
pub struct AudioBlock {
    /// チャンネル毎のサンプル配列 (-1.0 ~ 1.0)
    pub samples: Vec<Vec<f32>>,

    /// このブロックの開始タイムスタンプ (ナノ秒)
    ///
    /// UNIX_EPOCHからの経過時間
    pub timestamp_ns: u128,
}

impl AudioBlock {
    /// ブロック内のフレーム数
    pub fn frames(&self) -> usize {
        self.samples.first().map(Vec::len).unwrap_or(0)
    }
}

/// マルチチャンネル音声バッファ
///
/// チャンネル数とサンプリングレートは生成後に変化しない。
/// 各サンプルは -1.0 ~ 1.0 に正規化された浮動小数点値。
///
/// # Examples
///
/// ```
/// # use dronewatch::types::AudioBuffer;
/// let buffer = AudioBuffer::new(vec![vec![0.0; 22050]; 3], 22050).unwrap();
/// assert_eq!(buffer.channel_count(), 3);
/// assert!((buffer.duration_secs() - 1.0).abs() < 1e-9);
/// ```
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// チャンネル毎のサンプル配列からバッファを作成
    ///
    /// # Errors
    ///
    /// サンプリングレートが0、チャンネルが0、またはチャンネル間で
    /// サンプル数が異なる場合に `InvalidAudio` を返す。
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(DetectionError::InvalidAudio(
                "サンプリングレートが0です".to_string(),
            ));
        }
        if channels.is_empty() {
            return Err(DetectionError::InvalidAudio(
                "チャンネルがありません".to_string(),
            ));
        }
        if channels.len() > u16::MAX as usize {
            return Err(DetectionError::InvalidAudio(format!(
                "チャンネル数が多すぎます: {}",
                channels.len()
            )));
        }
        let frames = channels[0].len();
        if let Some((idx, ch)) = channels.iter().enumerate().find(|(_, c)| c.len() != frames) {
            return Err(DetectionError::InvalidAudio(format!(
                "チャンネル {} のサンプル数が一致しません ({} != {})",
                idx,
                ch.len(),
                frames
            )));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// インターリーブされたサンプル列からバッファを作成
    pub fn from_interleaved(data: &[f32], channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(DetectionError::InvalidAudio(
                "チャンネルがありません".to_string(),
            ));
        }
        let num_channels = channels as usize;
        let frames = data.len() / num_channels;
        let mut split = vec![Vec::with_capacity(frames); num_channels];
        for frame in data.chunks_exact(num_channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                split[ch].push(sample);
            }
        }
        Self::new(split, sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels.len() as u16,
        }
    }

    /// 1チャンネルあたりのサンプル数
    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// バッファの長さ（秒）
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// 指定チャンネルのサンプル
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// セグメント範囲を全チャンネル同期で切り出す
    ///
    /// 範囲はバッファ境界に切り詰められる。
    pub fn window(&self, segment: &Segment) -> AudioBuffer {
        let end = segment.end_sample.min(self.frames());
        let start = segment.start_sample.min(end);
        AudioBuffer {
            channels: self
                .channels
                .iter()
                .map(|ch| ch[start..end].to_vec())
                .collect(),
            sample_rate: self.sample_rate,
        }
    }
}

/// 解析セグメント
///
/// AudioBufferの連続した部分範囲。時間は秒、範囲はサンプル単位で保持する。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Segment {
    /// ファイル内での通し番号
    pub index: usize,

    /// 開始時刻（秒）
    pub start_time: f64,

    /// 終了時刻（秒）
    pub end_time: f64,

    #[serde(skip)]
    pub start_sample: usize,

    #[serde(skip)]
    pub end_sample: usize,
}

impl Segment {
    pub fn new(index: usize, start_sample: usize, end_sample: usize, sample_rate: u32) -> Self {
        Self {
            index,
            start_time: start_sample as f64 / sample_rate as f64,
            end_time: end_sample as f64 / sample_rate as f64,
            start_sample,
            end_sample,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn len(&self) -> usize {
        self.end_sample - self.start_sample
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 指定した時間範囲（秒）と重なるかどうか
    pub fn overlaps(&self, from_secs: f64, to_secs: f64) -> bool {
        self.start_time < to_secs && from_secs < self.end_time
    }
}

/// バッファオーバーフロー時のドロップポリシー
///
/// バッファ容量を超えた場合にどのデータを破棄するかを指定する。
///
/// # Examples
///
/// ```
/// # use dronewatch::types::DropPolicy;
/// let policy = DropPolicy::DropOldest; // 最古のデータから破棄
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// 最古のデータから破棄
    ///
    /// ライブ音声は巻き戻せないため、通常はこれを使用する
    DropOldest,

    /// 最新のデータを破棄
    DropNewest,

    /// ブロッキング（未実装）
    ///
    /// キャプチャを止めることはできないため DropOldest として扱われる。
    Block,
}

/// アレイ座標系での2次元位置（メートル）
///
/// 原点は基準マイク（インデックス0）。
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const ORIGIN: Point2 = Point2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl From<[f64; 2]> for Point2 {
    fn from(p: [f64; 2]) -> Self {
        Self { x: p[0], y: p[1] }
    }
}

/// 分類器が返すクラス確率の組
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ClassScores {
    pub non_drone: f32,
    pub drone: f32,
}

impl ClassScores {
    /// ドローン確率から確率の組を作成
    pub fn from_drone_probability(drone: f32) -> Self {
        Self {
            non_drone: 1.0 - drone,
            drone,
        }
    }
}

/// 1セグメント分の検出結果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    /// ドローンである確率 (0.0 ~ 1.0)
    pub probability: f32,

    /// probability >= 閾値
    pub is_drone: bool,

    /// 計算対象のセグメント
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<Segment>,
}

impl DetectionResult {
    pub fn new(probability: f32, threshold: f32, segment: Option<Segment>) -> Self {
        Self {
            probability,
            is_drone: probability >= threshold,
            segment,
        }
    }
}
