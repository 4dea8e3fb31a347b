use crate::error::{DetectionError, Result};
use crate::features::FeatureTensor;
use crate::types::ClassScores;

/// 特徴量テンソルをスコアリングする分類器の共通トレイト
///
/// 検出パイプラインはネットワーク構造や重み形式に依存しない。
/// このトレイトを満たすものなら何でも差し替えられる。
/// `Fn(&FeatureTensor) -> Result<ClassScores>` のクロージャもそのまま使える。
pub trait Classifier: Send + Sync {
    /// (非ドローン, ドローン) の確率を返す
    fn classify(&self, features: &FeatureTensor) -> Result<ClassScores>;

    /// ログ出力用の名前
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> Classifier for F
where
    F: Fn(&FeatureTensor) -> Result<ClassScores> + Send + Sync,
{
    fn classify(&self, features: &FeatureTensor) -> Result<ClassScores> {
        self(features)
    }
}

/// 重みファイル不要の参照スコアラー
///
/// ドローンのロータ音は時間的に安定した調波構造を持つ。
/// 各フレームについて「バンドの最大値 − 中央値」（ピーク性）を
/// スペクトルフラックスで減衰させたスコアを求め、
/// その90パーセンタイルをロジスティック関数で確率に変換する。
///
/// 学習済みネットワークの代替ではなく、外部分類器がない環境で
/// パイプラインを動かすための既定実装。商用電源のハムなど
/// 定常的な単一トーンも高スコアになる。
#[derive(Clone, Debug)]
pub struct TonalityClassifier {
    /// フラックスによる減衰係数
    pub flux_weight: f32,
    /// 採用するパーセンタイル (0.0 ~ 1.0)
    pub percentile: f32,
    /// ロジスティック関数の中心
    pub midpoint: f32,
    /// ロジスティック関数の傾き
    pub steepness: f32,
}

impl Default for TonalityClassifier {
    fn default() -> Self {
        Self {
            flux_weight: 4.0,
            percentile: 0.9,
            midpoint: 1.5,
            steepness: 3.0,
        }
    }
}

impl TonalityClassifier {
    /// 調波構造スコア（確率変換前）
    pub fn tonality(&self, features: &FeatureTensor) -> Result<f32> {
        let [depth, bands, frames] = features.shape();
        if depth == 0 || bands == 0 || frames < 2 {
            return Err(DetectionError::Classification(format!(
                "特徴量の形状が不正です: {:?}",
                features.shape()
            )));
        }

        let plane = features.plane(0);
        let at = |band: usize, frame: usize| plane[band * frames + frame];

        let mut column = vec![0.0f32; bands];
        let mut scores = Vec::with_capacity(frames - 1);
        for frame in 1..frames {
            for (band, slot) in column.iter_mut().enumerate() {
                *slot = at(band, frame);
            }
            column.sort_by(f32::total_cmp);
            let peakiness = column[bands - 1] - column[bands / 2];

            let flux = (0..bands)
                .map(|band| (at(band, frame) - at(band, frame - 1)).abs())
                .sum::<f32>()
                / bands as f32;

            scores.push(peakiness * (-self.flux_weight * flux).exp());
        }

        scores.sort_by(f32::total_cmp);
        let idx = ((self.percentile * scores.len() as f32) as usize).min(scores.len() - 1);
        Ok(scores[idx])
    }
}

impl Classifier for TonalityClassifier {
    fn classify(&self, features: &FeatureTensor) -> Result<ClassScores> {
        let score = self.tonality(features)?;
        let drone = 1.0 / (1.0 + (-self.steepness * (score - self.midpoint)).exp());
        Ok(ClassScores::from_drone_probability(drone))
    }

    fn name(&self) -> &str {
        "tonality"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;
    use crate::features::FeatureExtractor;

    fn features_of(samples: &[f32]) -> FeatureTensor {
        FeatureExtractor::new(&FeatureConfig::default(), 3.0)
            .extract(samples, 22050)
            .unwrap()
    }

    /// 基本周波数180Hzの調波音
    fn harmonic(secs: f32) -> Vec<f32> {
        let n = (22050.0 * secs) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / 22050.0;
                (1..=6)
                    .map(|h| {
                        let h = h as f32;
                        (2.0 * std::f32::consts::PI * 180.0 * h * t + 0.3 * h).sin() / h
                    })
                    .sum::<f32>()
                    * 0.4
            })
            .collect()
    }

    /// 線形合同法による再現可能な擬似ノイズ
    fn noise(secs: f32, amplitude: f32) -> Vec<f32> {
        let n = (22050.0 * secs) as usize;
        let mut state: u32 = 12345;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                ((state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_closure_classifier() {
        let classifier =
            |_: &FeatureTensor| -> Result<ClassScores> { Ok(ClassScores::from_drone_probability(0.8)) };
        let tensor = FeatureTensor::from_raw([1, 1, 2], vec![0.0, 0.0]).unwrap();
        let scores = classifier.classify(&tensor).unwrap();
        assert!((scores.drone - 0.8).abs() < 1e-6);
        assert!((scores.non_drone - 0.2).abs() < 1e-6);
        assert_eq!(classifier.name(), "custom");
    }

    #[test]
    fn test_harmonic_scores_high() {
        let classifier = TonalityClassifier::default();
        let scores = classifier.classify(&features_of(&harmonic(3.0))).unwrap();
        assert!(scores.drone > 0.9, "drone probability {}", scores.drone);
    }

    #[test]
    fn test_silence_scores_low() {
        let classifier = TonalityClassifier::default();
        let scores = classifier.classify(&features_of(&vec![0.0; 66150])).unwrap();
        assert!(scores.drone < 0.05, "drone probability {}", scores.drone);
    }

    #[test]
    fn test_broadband_noise_scores_low() {
        let classifier = TonalityClassifier::default();
        let scores = classifier.classify(&features_of(&noise(3.0, 0.3))).unwrap();
        assert!(scores.drone < 0.3, "drone probability {}", scores.drone);
    }

    #[test]
    fn test_rejects_too_few_frames() {
        let classifier = TonalityClassifier::default();
        let tensor = FeatureTensor::from_raw([1, 4, 1], vec![0.0; 4]).unwrap();
        assert!(matches!(
            classifier.classify(&tensor),
            Err(DetectionError::Classification(_))
        ));
    }
}
