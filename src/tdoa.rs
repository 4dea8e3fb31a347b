use crate::config::ArrayConfig;
use crate::error::{DetectionError, Result};
use crate::localizer::MicrophoneArray;
use crate::types::AudioBuffer;
use rayon::prelude::*;
use serde::Serialize;

/// 基準マイクに対する到達時間差（秒）
///
/// `delays` は基準以外のマイクをインデックス順に並べたもの。
/// 正の値はそのマイクが基準より音源から遠いことを表す。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TdoaVector {
    pub reference: usize,
    pub delays: Vec<f64>,
}

impl TdoaVector {
    pub fn new(reference: usize, delays: Vec<f64>) -> Self {
        Self { reference, delays }
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// 音速を掛けたレンジ差（メートル）
    pub fn range_differences(&self, sound_speed: f64) -> Vec<f64> {
        self.delays.iter().map(|d| d * sound_speed).collect()
    }
}

/// 正規化相互相関による TDOA 推定器
///
/// 探索するラグはアレイ寸法と音速から決まる物理的上限 ±(最大マイク間距離 / c) に
/// 1サンプルの余裕を加えた範囲に限定する。`subsample` が有効な場合は
/// 相関ピークを放物線補間してサンプル周期未満の分解能を得る。
#[derive(Clone, Debug)]
pub struct TdoaEstimator {
    sound_speed: f64,
    subsample: bool,
}

impl TdoaEstimator {
    pub fn new(sound_speed: f64, subsample: bool) -> Self {
        Self {
            sound_speed,
            subsample,
        }
    }

    pub fn from_config(config: &ArrayConfig) -> Self {
        Self::new(config.sound_speed, config.subsample_interpolation)
    }

    /// 探索するラグの上限（サンプル）
    pub fn max_lag_samples(
        &self,
        array: &MicrophoneArray,
        reference: usize,
        sample_rate: u32,
    ) -> usize {
        let max_delay = array.max_distance_from(reference) / self.sound_speed;
        (max_delay * sample_rate as f64).ceil() as usize + 1
    }

    /// 同期したマルチチャンネルウィンドウから TDOA ベクトルを推定
    ///
    /// チャンネル i はマイク i に対応する。
    ///
    /// # Errors
    ///
    /// チャンネル数が3未満、マイク数と不一致、基準チャンネルが範囲外、
    /// ウィンドウが短すぎる、または無音チャンネルがある場合に
    /// `InsufficientData` を返す。
    pub fn estimate(
        &self,
        window: &AudioBuffer,
        array: &MicrophoneArray,
        reference: usize,
    ) -> Result<TdoaVector> {
        let channels = window.channel_count();
        if channels < 3 {
            return Err(DetectionError::InsufficientData(format!(
                "TDOA 推定には3チャンネル以上が必要です: {} チャンネル",
                channels
            )));
        }
        if channels != array.len() {
            return Err(DetectionError::InsufficientData(format!(
                "チャンネル数 {} とマイク数 {} が一致しません",
                channels,
                array.len()
            )));
        }
        if reference >= channels {
            return Err(DetectionError::InsufficientData(format!(
                "基準チャンネル {} が範囲外です",
                reference
            )));
        }

        let sample_rate = window.sample_rate();
        let max_lag = self.max_lag_samples(array, reference, sample_rate);
        if window.frames() <= 2 * max_lag {
            return Err(DetectionError::InsufficientData(format!(
                "ウィンドウが短すぎます: {} サンプル (最大ラグ {})",
                window.frames(),
                max_lag
            )));
        }

        let reference_samples = centered(window.channels()[reference].as_slice());
        if energy(&reference_samples) < 1e-12 {
            return Err(DetectionError::InsufficientData(format!(
                "基準チャンネル {} が無音です",
                reference
            )));
        }

        let others: Vec<usize> = (0..channels).filter(|&ch| ch != reference).collect();
        let delays = others
            .par_iter()
            .map(|&ch| {
                let other = centered(window.channels()[ch].as_slice());
                if energy(&other) < 1e-12 {
                    return Err(DetectionError::InsufficientData(format!(
                        "チャンネル {} が無音です",
                        ch
                    )));
                }
                let lag = self.peak_lag(&reference_samples, &other, max_lag);
                Ok(lag / sample_rate as f64)
            })
            .collect::<Result<Vec<f64>>>()?;

        log::debug!(
            "TDOA (基準 {}): {:?} µs",
            reference,
            delays.iter().map(|d| (d * 1e6).round()).collect::<Vec<_>>()
        );

        Ok(TdoaVector::new(reference, delays))
    }

    /// `Σ x[i]·y[i+k]` の正規化相関を最大にするラグ k（サンプル、小数あり）
    fn peak_lag(&self, x: &[f64], y: &[f64], max_lag: usize) -> f64 {
        let lags: Vec<isize> = (-(max_lag as isize)..=max_lag as isize).collect();
        let scores: Vec<f64> = lags.iter().map(|&k| normalized_correlation(x, y, k)).collect();

        let mut best = 0;
        for (i, &score) in scores.iter().enumerate() {
            if score > scores[best] {
                best = i;
            }
        }
        let mut lag = lags[best] as f64;

        if self.subsample && best > 0 && best + 1 < scores.len() {
            let (y1, y2, y3) = (scores[best - 1], scores[best], scores[best + 1]);
            let denom = y1 - 2.0 * y2 + y3;
            if denom < 0.0 {
                lag += (0.5 * (y1 - y3) / denom).clamp(-0.5, 0.5);
            }
        }
        lag
    }
}

/// 直流成分を除いた f64 列
fn centered(samples: &[f32]) -> Vec<f64> {
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len().max(1) as f64;
    samples.iter().map(|&s| s as f64 - mean).collect()
}

fn energy(samples: &[f64]) -> f64 {
    samples.iter().map(|s| s * s).sum()
}

/// 重なり区間でのラグ k の正規化相互相関
fn normalized_correlation(x: &[f64], y: &[f64], k: isize) -> f64 {
    let n = x.len().min(y.len()) as isize;
    let start = 0.max(-k);
    let end = n.min(n - k);
    if start >= end {
        return 0.0;
    }
    let (mut num, mut ex, mut ey) = (0.0, 0.0, 0.0);
    for i in start..end {
        let a = x[i as usize];
        let b = y[(i + k) as usize];
        num += a * b;
        ex += a * a;
        ey += b * b;
    }
    num / ((ex * ey).sqrt() + 1e-12)
}
