//! dronewatch - マイクアレイによるドローン音響検出・位置推定システム
//!
//! このクレートは、マルチチャンネルの音声からドローンの飛行音を検出し、
//! マイク間の到達時間差 (TDOA) から音源の2次元位置を推定する機能を提供します。
//!
//! # 主な機能
//!
//! - **セグメント分割**: 長時間音声を3秒・50%オーバーラップのウィンドウに分割
//! - **特徴量抽出**: メルスペクトログラム (3 × 64 × 259) を生成
//! - **検出**: 差し替え可能な分類器でセグメント毎にスコアリングし、最大値で集計
//! - **TDOA推定**: 正規化相互相関（放物線補間によるサブサンプル精度）
//! - **位置推定**: 最小二乗多辺測量 + Gauss-Newton。2チャンネル以下は模擬配置
//! - **リアルタイム監視**: ライブ入力をバックグラウンドスレッドで解析し、イベントを送出
//!
//! # アーキテクチャ
//!
//! ```text
//! [WAV / AudioSource] → [AudioBuffer] → [SegmentWindower]
//!                                              ↓
//!                         基準チャンネル → [FeatureExtractor] → [Classifier]
//!                                              ↓                      ↓
//!                         同期ウィンドウ → [TdoaEstimator]    [DetectionEngine]
//!                                              ↓                      ↓
//!                                         [Localizer] ──→ [DroneAnalyzer] → AnalysisReport
//!                                                                ↑
//!                                                      [RealTimeMonitor] → MonitorEvent
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use dronewatch::analyzer::DroneAnalyzer;
//! use dronewatch::classifier::TonalityClassifier;
//! use dronewatch::config::Config;
//! use std::sync::Arc;
//!
//! let config = Config::load_or_default("config.toml").unwrap();
//! let buffer = dronewatch::wav_reader::load_wav("recording.wav").unwrap();
//!
//! let analyzer = DroneAnalyzer::new(&config, Arc::new(TonalityClassifier::default()));
//! let report = analyzer.analyze(&buffer, 0.7, true).unwrap();
//! println!("{}", serde_json::to_string_pretty(&report).unwrap());
//! ```

pub mod analyzer;
pub mod audio_input;
pub mod buffer;
pub mod classifier;
pub mod config;
pub mod detection;
pub mod error;
pub mod features;
pub mod localizer;
pub mod monitor;
pub mod source;
pub mod tdoa;
pub mod types;
pub mod wav_reader;
pub mod windower;

pub use error::{DetectionError, Result};
