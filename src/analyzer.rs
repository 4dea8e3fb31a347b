use crate::classifier::Classifier;
use crate::config::Config;
use crate::detection::{AggregatedResult, DetectionEngine};
use crate::error::Result;
use crate::localizer::{Localizer, PositionEstimate};
use crate::tdoa::TdoaEstimator;
use crate::types::{AudioBuffer, Point2};
use crate::wav_reader;
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// 検出と位置推定をまとめた解析結果
///
/// 位置推定に失敗しても検出結果は必ず返り、
/// その場合は `localization` が空で `localization_note` に理由が入る。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalysisReport {
    #[serde(flatten)]
    pub detection: AggregatedResult,
    pub localization: Option<PositionEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localization_note: Option<String>,
    /// 図示用のマイク位置
    pub microphones: Vec<Point2>,
}

/// バッチ解析の1ファイル分の結果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileReport {
    pub filename: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// ファイル毎の成否（失敗は他のファイルに影響しない）
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Success(AnalysisReport),
    Error { error: String },
}

impl FileReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, FileOutcome::Success(_))
    }
}

/// 検出エンジンと位置推定器の組み合わせ
///
/// ファイル解析とリアルタイム監視の両方から使われる。
pub struct DroneAnalyzer {
    engine: DetectionEngine,
    estimator: TdoaEstimator,
    localizer: Localizer,
    simulation_seed: u64,
}

impl DroneAnalyzer {
    pub fn new(config: &Config, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            engine: DetectionEngine::new(config, classifier),
            estimator: TdoaEstimator::from_config(&config.array),
            localizer: Localizer::from_config(&config.array),
            simulation_seed: config.array.simulation_seed,
        }
    }

    pub fn engine(&self) -> &DetectionEngine {
        &self.engine
    }

    pub fn localizer(&self) -> &Localizer {
        &self.localizer
    }

    /// バッファを解析し、ドローンを検出した場合は最良セグメントで位置を推定する
    ///
    /// # Errors
    ///
    /// 検出エンジンのエラー（`InvalidAudio`, `NoValidSegments`）のみを返す。
    /// 位置推定のエラーは `localization_note` に記録される。
    pub fn analyze(
        &self,
        buffer: &AudioBuffer,
        threshold: f32,
        analyze_long: bool,
    ) -> Result<AnalysisReport> {
        let detection = self.engine.detect(buffer, threshold, analyze_long)?;

        let (localization, localization_note) = match &detection.best_segment {
            Some(segment) => self.locate(&buffer.window(segment), detection.probability),
            None => (None, None),
        };

        Ok(AnalysisReport {
            detection,
            localization,
            localization_note,
            microphones: self.localizer.array().positions().to_vec(),
        })
    }

    /// 複数のWAVファイルを解析する
    ///
    /// 読み込み・解析の失敗はそのファイルの `Error` として記録し、
    /// 残りのファイルの解析は続ける。結果は入力順。
    pub fn analyze_files<P: AsRef<Path> + Sync>(
        &self,
        paths: &[P],
        threshold: f32,
        analyze_long: bool,
    ) -> Vec<FileReport> {
        let reports: Vec<FileReport> = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                let outcome = wav_reader::load_wav(path)
                    .and_then(|buffer| Ok(self.analyze(&buffer, threshold, analyze_long)?));
                let outcome = match outcome {
                    Ok(report) => FileOutcome::Success(report),
                    Err(e) => {
                        log::warn!("ファイルの解析に失敗: {:?}: {:#}", path, e);
                        FileOutcome::Error {
                            error: format!("{:#}", e),
                        }
                    }
                };
                FileReport {
                    filename: path.display().to_string(),
                    outcome,
                }
            })
            .collect();

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        log::info!(
            "バッチ解析完了: {} ファイル (失敗 {})",
            reports.len(),
            failed
        );
        reports
    }

    /// 同期ウィンドウから位置を推定
    ///
    /// 3チャンネル以上なら TDOA 多辺測量、それ未満なら模擬配置。
    pub fn locate(
        &self,
        window: &AudioBuffer,
        probability: f32,
    ) -> (Option<PositionEstimate>, Option<String>) {
        if window.channel_count() < 3 {
            log::debug!(
                "{} チャンネルのため模擬位置を使用します",
                window.channel_count()
            );
            return (
                Some(self.localizer.simulate(probability, self.simulation_seed)),
                None,
            );
        }

        let result = self
            .estimator
            .estimate(
                window,
                self.localizer.array(),
                self.engine.reference_channel(),
            )
            .and_then(|tdoa| self.localizer.localize(&tdoa));

        match result {
            Ok(estimate) => (Some(estimate), None),
            Err(e) => {
                log::warn!("位置推定に失敗: {}", e);
                (None, Some(e.to_string()))
            }
        }
    }
}
