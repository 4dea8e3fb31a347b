use crate::classifier::Classifier;
use crate::config::Config;
use crate::error::{DetectionError, Result};
use crate::features::FeatureExtractor;
use crate::types::{AudioBuffer, DetectionResult, Segment};
use crate::windower::SegmentWindower;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;

const MIN_THRESHOLD: f32 = 0.10;
const MAX_THRESHOLD: f32 = 1.00;

/// セグメント単位の結果
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SegmentOutcome {
    Scored { probability: f32, is_drone: bool },
    /// 特徴量抽出または分類に失敗（集計からは除外される）
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentReport {
    #[serde(flatten)]
    pub segment: Segment,
    #[serde(flatten)]
    pub outcome: SegmentOutcome,
}

impl SegmentReport {
    pub fn probability(&self) -> Option<f32> {
        match self.outcome {
            SegmentOutcome::Scored { probability, .. } => Some(probability),
            SegmentOutcome::Failed { .. } => None,
        }
    }

    pub fn is_drone(&self) -> bool {
        matches!(self.outcome, SegmentOutcome::Scored { is_drone: true, .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SegmentOutcome::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub total_segments: usize,
    pub detected_segments: usize,
    pub failed_segments: usize,
    /// 成功したセグメントの最大確率
    pub max_confidence: f32,
}

/// ファイル（またはウィンドウ）全体の検出結果
///
/// 単一セグメントモードでも同じ形で、`segments` が1要素になる。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregatedResult {
    /// 全セグメントの最大確率（平均ではない）
    pub probability: f32,
    pub is_drone: bool,
    /// 実際に適用した閾値
    pub threshold: f32,
    pub segments: Vec<SegmentReport>,
    /// 検出セグメントのうち確率最大のもの（同率なら開始が早いもの）
    pub best_segment: Option<Segment>,
    pub detection_summary: DetectionSummary,
}

impl AggregatedResult {
    /// 最良セグメントの検出結果
    pub fn best(&self) -> Option<DetectionResult> {
        let segment = self.best_segment.clone()?;
        let probability = self
            .segments
            .iter()
            .find(|r| r.segment == segment)
            .and_then(SegmentReport::probability)?;
        Some(DetectionResult::new(probability, self.threshold, Some(segment)))
    }
}

/// 検出エンジン
///
/// セグメント分割 → 基準チャンネルの特徴量抽出 → 分類 → 集計を行う。
/// 内部状態を変更しないため、複数スレッドから同時に呼び出せる。
pub struct DetectionEngine {
    windower: SegmentWindower,
    extractor: FeatureExtractor,
    classifier: Arc<dyn Classifier>,
    reference_channel: usize,
}

impl DetectionEngine {
    pub fn new(config: &Config, classifier: Arc<dyn Classifier>) -> Self {
        let windower = SegmentWindower::new(&config.detection);
        let extractor =
            FeatureExtractor::new(&config.features, windower.segment_duration_secs());
        Self {
            windower,
            extractor,
            classifier,
            reference_channel: config.detection.reference_channel,
        }
    }

    pub fn windower(&self) -> &SegmentWindower {
        &self.windower
    }

    pub fn reference_channel(&self) -> usize {
        self.reference_channel
    }

    /// バッファ全体を解析して集計結果を返す
    ///
    /// 閾値は 0.10 ~ 1.00 に丸められる。
    ///
    /// # Errors
    ///
    /// - 空のバッファ、基準チャンネルが範囲外: `InvalidAudio`
    /// - 全セグメントが失敗: `NoValidSegments`
    pub fn detect(
        &self,
        buffer: &AudioBuffer,
        threshold: f32,
        analyze_long: bool,
    ) -> Result<AggregatedResult> {
        let threshold = clamp_threshold(threshold);
        let reference = buffer.channel(self.reference_channel).ok_or_else(|| {
            DetectionError::InvalidAudio(format!(
                "基準チャンネル {} がありません ({} チャンネル)",
                self.reference_channel,
                buffer.channel_count()
            ))
        })?;

        let segments: Vec<Segment> = self.windower.segments(buffer, analyze_long)?.collect();
        let sample_rate = buffer.sample_rate();

        let reports: Vec<SegmentReport> = segments
            .into_par_iter()
            .map(|segment| {
                let samples = &reference[segment.start_sample..segment.end_sample];
                let outcome = match self.score(samples, sample_rate) {
                    Ok(probability) => SegmentOutcome::Scored {
                        probability,
                        is_drone: probability >= threshold,
                    },
                    Err(e) => {
                        log::warn!(
                            "セグメント {} ({:.1}-{:.1}秒) の解析に失敗: {}",
                            segment.index,
                            segment.start_time,
                            segment.end_time,
                            e
                        );
                        SegmentOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                SegmentReport { segment, outcome }
            })
            .collect();

        let result = aggregate(reports, threshold)?;
        log::info!(
            "検出結果: 確率 {:.3} ドローン={} ({}/{} セグメント検出, 失敗 {})",
            result.probability,
            result.is_drone,
            result.detection_summary.detected_segments,
            result.detection_summary.total_segments,
            result.detection_summary.failed_segments
        );
        Ok(result)
    }

    /// 1セグメント分のドローン確率
    pub fn score(&self, samples: &[f32], sample_rate: u32) -> Result<f32> {
        let features = self.extractor.extract(samples, sample_rate)?;
        let scores = self.classifier.classify(&features)?;
        for (label, value) in [("drone", scores.drone), ("non_drone", scores.non_drone)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(DetectionError::Classification(format!(
                    "分類器 {} が範囲外の確率を返しました: {}={}",
                    self.classifier.name(),
                    label,
                    value
                )));
            }
        }
        Ok(scores.drone)
    }
}

fn clamp_threshold(threshold: f32) -> f32 {
    if threshold.is_nan() {
        log::warn!("閾値が NaN です。0.70 を使用します");
        return 0.70;
    }
    let clamped = threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD);
    if clamped != threshold {
        log::warn!(
            "閾値 {} は範囲外のため {} に丸めました",
            threshold,
            clamped
        );
    }
    clamped
}

fn aggregate(segments: Vec<SegmentReport>, threshold: f32) -> Result<AggregatedResult> {
    let total = segments.len();
    let failed = segments.iter().filter(|r| r.is_failed()).count();
    if failed == total {
        return Err(DetectionError::NoValidSegments { total });
    }

    let probability = segments
        .iter()
        .filter_map(SegmentReport::probability)
        .fold(0.0f32, f32::max);

    let mut best: Option<&SegmentReport> = None;
    for report in segments.iter().filter(|r| r.is_drone()) {
        let better = match best {
            None => true,
            Some(current) => {
                let p = report.probability().unwrap_or(0.0);
                let q = current.probability().unwrap_or(0.0);
                p > q || (p == q && report.segment.start_time < current.segment.start_time)
            }
        };
        if better {
            best = Some(report);
        }
    }
    let best_segment = best.map(|r| r.segment.clone());
    let detected = segments.iter().filter(|r| r.is_drone()).count();

    Ok(AggregatedResult {
        probability,
        is_drone: detected > 0,
        threshold,
        best_segment,
        detection_summary: DetectionSummary {
            total_segments: total,
            detected_segments: detected,
            failed_segments: failed,
            max_confidence: probability,
        },
        segments,
    })
}
