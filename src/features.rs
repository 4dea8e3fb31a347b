use crate::config::FeatureConfig;
use crate::error::{DetectionError, Result};
use realfft::{RealFftPlanner, RealToComplex};
use rubato::{FftFixedIn, Resampler};
use std::sync::Arc;

/// 分類器入力の特徴量テンソル
///
/// 形状は (stack_depth, n_mels, time_frames)、標準では 3 × 64 × 259。
/// 入力セグメントの長さに関わらず形状は一定。
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureTensor {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl FeatureTensor {
    /// 1枚のメルスペクトログラム (n_mels × time_frames, 行優先) を depth 枚に複製する
    fn stacked(plane: Vec<f32>, depth: usize, n_mels: usize, frames: usize) -> Self {
        let mut data = Vec::with_capacity(plane.len() * depth);
        for _ in 0..depth {
            data.extend_from_slice(&plane);
        }
        Self {
            shape: [depth, n_mels, frames],
            data,
        }
    }

    /// 任意のデータからテンソルを作成（テスト・外部分類器向け）
    pub fn from_raw(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(DetectionError::FeatureExtraction(format!(
                "形状 {:?} とデータ長 {} が一致しません",
                shape,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// 行優先で並んだ全要素
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// 指定インデックスの平面 (n_mels × time_frames)
    pub fn plane(&self, depth: usize) -> &[f32] {
        let size = self.shape[1] * self.shape[2];
        &self.data[depth * size..(depth + 1) * size]
    }

    pub fn get(&self, depth: usize, mel: usize, frame: usize) -> f32 {
        self.data[(depth * self.shape[1] + mel) * self.shape[2] + frame]
    }
}

/// メルスペクトログラム特徴量抽出器
///
/// # アルゴリズム
///
/// 1. 処理用サンプリングレート（22.05kHz）へリサンプリング (rubato)
/// 2. セグメント長にゼロパディング／切り詰め
/// 3. ピーク正規化
/// 4. Hann窓STFT (n_fft=1024, hop=256) の振幅スペクトル
/// 5. 三角メルフィルタバンク (64バンド) → dB
/// 6. 時間方向を線形補間で 259 フレームに揃える
/// 7. 平均0・分散1に正規化し、3枚にスタック
///
/// 完全な無音は平坦なスペクトログラム（全要素0）となり、エラーにはならない。
pub struct FeatureExtractor {
    config: FeatureConfig,
    target_samples: usize,
    window: Vec<f32>,
    window_scale: f32,
    filterbank: Vec<MelFilter>,
    fft: Arc<dyn RealToComplex<f32>>,
}

/// 1バンド分の三角フィルタ（疎表現）
struct MelFilter {
    start_bin: usize,
    weights: Vec<f32>,
}

impl FeatureExtractor {
    pub fn new(config: &FeatureConfig, segment_duration_secs: f64) -> Self {
        let target_samples =
            ((segment_duration_secs * config.sample_rate as f64).round() as usize).max(config.n_fft);
        let window = hann(config.n_fft);
        let power: f32 = window.iter().map(|w| w * w).sum();
        let window_scale = (1.0 / (config.sample_rate as f32 * power)).sqrt();
        let filterbank = mel_filterbank(config.sample_rate, config.n_fft, config.n_mels);
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(config.n_fft);

        Self {
            config: config.clone(),
            target_samples,
            window,
            window_scale,
            filterbank,
            fft,
        }
    }

    /// 出力テンソルの形状
    pub fn output_shape(&self) -> [usize; 3] {
        [
            self.config.stack_depth,
            self.config.n_mels,
            self.config.time_frames,
        ]
    }

    /// 1チャンネル分のセグメントから特徴量を抽出
    ///
    /// # Errors
    ///
    /// 空のセグメント、非有限値を含むサンプル、サンプリングレート0の場合に
    /// `FeatureExtraction` を返す。
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<FeatureTensor> {
        if samples.is_empty() {
            return Err(DetectionError::FeatureExtraction(
                "空のセグメントです".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(DetectionError::FeatureExtraction(
                "サンプリングレートが0です".to_string(),
            ));
        }
        if let Some(pos) = samples.iter().position(|s| !s.is_finite()) {
            return Err(DetectionError::FeatureExtraction(format!(
                "非有限のサンプル値があります (位置 {})",
                pos
            )));
        }

        let mut signal = if sample_rate == self.config.sample_rate {
            samples.to_vec()
        } else {
            resample(samples, sample_rate, self.config.sample_rate)?
        };
        signal.resize(self.target_samples, 0.0);

        let peak = signal.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        if peak == 0.0 {
            log::debug!("無音セグメント: 平坦な特徴量を返します");
            return Ok(self.flat());
        }
        for s in signal.iter_mut() {
            *s /= peak;
        }

        let mel_db = self.mel_spectrogram_db(&signal)?;
        let frames = mel_db.len() / self.config.n_mels;
        let mut plane = resize_frames(&mel_db, self.config.n_mels, frames, self.config.time_frames);
        standardize(&mut plane);

        log::debug!(
            "特徴量抽出: {} サンプル @ {}Hz → {:?}",
            samples.len(),
            sample_rate,
            self.output_shape()
        );

        Ok(FeatureTensor::stacked(
            plane,
            self.config.stack_depth,
            self.config.n_mels,
            self.config.time_frames,
        ))
    }

    /// 全要素0の特徴量（無音セグメント用）
    fn flat(&self) -> FeatureTensor {
        let [depth, n_mels, frames] = self.output_shape();
        FeatureTensor::stacked(vec![0.0; n_mels * frames], depth, n_mels, frames)
    }

    /// dBスケールのメルスペクトログラム (n_mels × frames, 行優先)
    fn mel_spectrogram_db(&self, signal: &[f32]) -> Result<Vec<f32>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let n_mels = self.config.n_mels;
        let frames = 1 + (signal.len() - n_fft) / hop;

        let mut input = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let mut magnitude = vec![0.0f32; spectrum.len()];
        let mut mel = vec![0.0f32; n_mels * frames];

        for frame in 0..frames {
            let offset = frame * hop;
            for (i, slot) in input.iter_mut().enumerate() {
                *slot = signal[offset + i] * self.window[i];
            }
            self.fft
                .process(&mut input, &mut spectrum)
                .map_err(|e| DetectionError::FeatureExtraction(format!("FFTに失敗: {}", e)))?;
            for (m, c) in magnitude.iter_mut().zip(spectrum.iter()) {
                *m = c.norm() * self.window_scale;
            }
            for (band, filter) in self.filterbank.iter().enumerate() {
                let energy: f32 = filter
                    .weights
                    .iter()
                    .zip(&magnitude[filter.start_bin..])
                    .map(|(w, m)| w * m)
                    .sum();
                mel[band * frames + frame] = energy;
            }
        }

        for v in mel.iter_mut() {
            *v = 10.0 * (*v + 1e-10).log10();
        }
        Ok(mel)
    }
}

/// 周期Hann窓
fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let t = (std::f32::consts::PI * i as f32) / n as f32;
            t.sin() * t.sin()
        })
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// 0Hz ~ ナイキスト周波数を等メル間隔で覆う三角フィルタバンク
///
/// 各フィルタは帯域幅で面積正規化する。
fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<MelFilter> {
    let bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let low = hz_to_mel(0.0);
    let high = hz_to_mel(nyquist);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(low + (high - low) * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_hz = sample_rate as f64 / n_fft as f64;

    (0..n_mels)
        .map(|m| {
            let (left, center, right) = (points[m], points[m + 1], points[m + 2]);
            let norm = 2.0 / (right - left);
            let weights: Vec<(usize, f32)> = (0..bins)
                .filter_map(|k| {
                    let f = k as f64 * bin_hz;
                    let rise = (f - left) / (center - left);
                    let fall = (right - f) / (right - center);
                    let w = rise.min(fall);
                    (w > 0.0).then(|| (k, (w * norm) as f32))
                })
                .collect();
            let start_bin = weights.first().map(|(k, _)| *k).unwrap_or(0);
            MelFilter {
                start_bin,
                weights: weights.into_iter().map(|(_, w)| w).collect(),
            }
        })
        .collect()
}

/// rubato の FFT リサンプラによるサンプリングレート変換
///
/// セグメント全体を1チャンクとして処理し、フィルタ遅延分を除いて
/// floor(入力長 × to / from) サンプルを返す。
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    let n = samples.len();
    let m = (n as u64 * to as u64 / from.max(1) as u64) as usize;
    if n == 0 || m == 0 {
        return Ok(Vec::new());
    }
    if from == to {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from as usize, to as usize, n, (n / 1024).max(1), 1)
            .map_err(|e| DetectionError::FeatureExtraction(format!("リサンプラの作成に失敗: {}", e)))?;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(delay + m);
    let processed = resampler
        .process(&[samples], None)
        .map_err(|e| DetectionError::FeatureExtraction(format!("リサンプリングに失敗: {}", e)))?;
    output.extend_from_slice(&processed[0]);

    // 遅延分の出力をゼロ入力で押し出す
    while output.len() < delay + m {
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| DetectionError::FeatureExtraction(format!("リサンプリングに失敗: {}", e)))?;
        if tail[0].is_empty() {
            break;
        }
        output.extend_from_slice(&tail[0]);
    }

    output.drain(..delay.min(output.len()));
    output.resize(m, 0.0);
    Ok(output)
}

/// 時間方向のフレーム数を線形補間で target に揃える
fn resize_frames(data: &[f32], rows: usize, frames: usize, target: usize) -> Vec<f32> {
    if frames == target {
        return data.to_vec();
    }
    let mut out = vec![0.0f32; rows * target];
    for row in 0..rows {
        let src = &data[row * frames..(row + 1) * frames];
        let dst = &mut out[row * target..(row + 1) * target];
        for (i, slot) in dst.iter_mut().enumerate() {
            if frames == 1 || target == 1 {
                *slot = src[0];
                continue;
            }
            let pos = i as f64 * (frames - 1) as f64 / (target - 1) as f64;
            let i0 = pos.floor() as usize;
            let i1 = (i0 + 1).min(frames - 1);
            let frac = (pos - i0 as f64) as f32;
            // 一定値の行は補間後も厳密に一定
            *slot = src[i0] + (src[i1] - src[i0]) * frac;
        }
    }
    out
}

/// 平均0・分散1に正規化
///
/// 標準偏差が平均の大きさに対して丸め誤差程度しかない場合は全要素0とする。
fn standardize(data: &mut [f32]) {
    let n = data.len() as f64;
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    if std <= 1e-6 * mean.abs().max(1.0) {
        data.fill(0.0);
        return;
    }
    for v in data.iter_mut() {
        *v = ((*v as f64 - mean) / (std + 1e-8)) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(&FeatureConfig::default(), 3.0)
    }

    fn tone(freq: f32, sample_rate: u32, secs: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * secs) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_output_shape_is_fixed() {
        let fx = extractor();
        for secs in [0.2, 1.0, 3.0, 4.5] {
            let tensor = fx.extract(&tone(440.0, 22050, secs), 22050).unwrap();
            assert_eq!(tensor.shape(), [3, 64, 259]);
            assert_eq!(tensor.data().len(), 3 * 64 * 259);
        }
    }

    #[test]
    fn test_resampled_input_has_same_shape() {
        let fx = extractor();
        let tensor = fx.extract(&tone(440.0, 48000, 3.0), 48000).unwrap();
        assert_eq!(tensor.shape(), [3, 64, 259]);
        assert!(tensor.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_silence_is_flat() {
        let fx = extractor();
        for len in [66150, 1000, 70000] {
            let tensor = fx.extract(&vec![0.0; len], 22050).unwrap();
            assert_eq!(tensor.shape(), [3, 64, 259]);
            assert!(tensor.data().iter().all(|&v| v == 0.0));
        }
        // リサンプリング経路でも同様
        let tensor = fx.extract(&vec![0.0; 144000], 48000).unwrap();
        assert!(tensor.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_constant_rows_survive_frame_resize() {
        let data = vec![-100.0f32; 2 * 255];
        let resized = resize_frames(&data, 2, 255, 259);
        assert_eq!(resized.len(), 2 * 259);
        assert!(resized.iter().all(|&v| v == -100.0));
    }

    #[test]
    fn test_standardize_ignores_rounding_noise() {
        // -100dB 付近で数ulp揺らいだだけの平面は平坦とみなす
        let mut plane: Vec<f32> = (0..64 * 259)
            .map(|i| if i % 7 == 0 { -100.00001 } else { -100.0 })
            .collect();
        standardize(&mut plane);
        assert!(plane.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_deterministic() {
        let fx = extractor();
        let samples = tone(300.0, 22050, 3.0);
        let a = fx.extract(&samples, 22050).unwrap();
        let b = fx.extract(&samples, 22050).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_planes_are_identical_and_standardized() {
        let fx = extractor();
        let tensor = fx.extract(&tone(1000.0, 22050, 3.0), 22050).unwrap();
        assert_eq!(tensor.plane(0), tensor.plane(1));
        assert_eq!(tensor.plane(1), tensor.plane(2));

        let plane = tensor.plane(0);
        let mean = plane.iter().map(|&v| v as f64).sum::<f64>() / plane.len() as f64;
        let var = plane.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / plane.len() as f64;
        assert!(mean.abs() < 1e-3);
        assert!((var - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_tone_energy_in_expected_band() {
        let fx = extractor();
        let tensor = fx.extract(&tone(1000.0, 22050, 3.0), 22050).unwrap();
        // 時間平均が最大のメルバンドを探す
        let band_means: Vec<f32> = (0..64)
            .map(|m| (0..259).map(|t| tensor.get(0, m, t)).sum::<f32>() / 259.0)
            .collect();
        let best = band_means
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // 1kHz はメル尺度で 0~11025Hz の下から 1/4 程度
        let mel_1k = hz_to_mel(1000.0) / hz_to_mel(11025.0) * 65.0;
        assert!((best as f64 - mel_1k).abs() <= 2.0, "best band {}", best);
    }

    #[test]
    fn test_rejects_degenerate_input() {
        let fx = extractor();
        assert!(matches!(
            fx.extract(&[], 22050),
            Err(DetectionError::FeatureExtraction(_))
        ));
        assert!(matches!(
            fx.extract(&[0.0, f32::NAN, 0.0], 22050),
            Err(DetectionError::FeatureExtraction(_))
        ));
        assert!(matches!(
            fx.extract(&[0.0; 10], 0),
            Err(DetectionError::FeatureExtraction(_))
        ));
    }

    #[test]
    fn test_resample_preserves_tone() {
        let input = tone(200.0, 44100, 1.0);
        let output = resample(&input, 44100, 22050).unwrap();
        assert_eq!(output.len(), 22050);

        // 両端のフィルタ過渡を除いた区間で比較
        let expected = tone(200.0, 22050, 1.0);
        let max_err = output[2205..19845]
            .iter()
            .zip(&expected[2205..19845])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-2, "max error {}", max_err);
    }

    #[test]
    fn test_resample_same_rate_and_empty() {
        let input = tone(200.0, 22050, 0.1);
        assert_eq!(resample(&input, 22050, 22050).unwrap(), input);
        assert!(resample(&[], 48000, 22050).unwrap().is_empty());
    }

    #[test]
    fn test_from_raw_shape_mismatch() {
        assert!(FeatureTensor::from_raw([1, 2, 3], vec![0.0; 6]).is_ok());
        assert!(FeatureTensor::from_raw([1, 2, 3], vec![0.0; 5]).is_err());
    }
}
