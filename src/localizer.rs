use crate::config::ArrayConfig;
use crate::error::{DetectionError, Result};
use crate::tdoa::TdoaVector;
use crate::types::Point2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Serializer};

/// 残差がこの値（メートル）のとき信頼度は 1/e
const RESIDUAL_SCALE_M: f64 = 0.05;

/// Gauss-Newton 反復の上限
const MAX_ITERATIONS: usize = 20;

/// マイクアレイの配置
///
/// インデックス0が座標系の原点（基準マイク）。位置はメートル単位。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MicrophoneArray {
    positions: Vec<Point2>,
}

impl Default for MicrophoneArray {
    /// L字型、0.5m間隔の3マイク
    fn default() -> Self {
        Self::new(vec![
            Point2::new(0.0, 0.0),
            Point2::new(0.5, 0.0),
            Point2::new(0.0, 0.5),
        ])
    }
}

impl MicrophoneArray {
    pub fn new(positions: Vec<Point2>) -> Self {
        Self { positions }
    }

    pub fn positions(&self) -> &[Point2] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// 全マイクが一直線上（または同一点）にあるかどうか
    ///
    /// 3個未満の場合も2次元位置が決まらないため true を返す。
    pub fn is_collinear(&self) -> bool {
        if self.positions.len() < 3 {
            return true;
        }
        let origin = self.positions[0];
        let Some(far) = self
            .positions
            .iter()
            .copied()
            .max_by(|a, b| origin.distance(a).total_cmp(&origin.distance(b)))
        else {
            return true;
        };
        let baseline = origin.distance(&far);
        if baseline < 1e-9 {
            return true;
        }
        let (ux, uy) = ((far.x - origin.x) / baseline, (far.y - origin.y) / baseline);
        // 基線からの垂直距離がすべて 1µm 未満なら一直線
        self.positions
            .iter()
            .all(|p| (ux * (p.y - origin.y) - uy * (p.x - origin.x)).abs() < 1e-6)
    }

    /// 指定マイクから最も遠いマイクまでの距離
    pub fn max_distance_from(&self, reference: usize) -> f64 {
        let Some(origin) = self.positions.get(reference) else {
            return 0.0;
        };
        self.positions
            .iter()
            .map(|p| origin.distance(p))
            .fold(0.0, f64::max)
    }
}

/// 位置推定結果
///
/// 幾何に基づく推定と模擬配置はバリアントで区別される。
/// 模擬配置の位置は物理的な意味を持たないため、利用側は
/// `is_simulated()` を確認してから扱うこと。
#[derive(Clone, Debug, PartialEq)]
pub enum PositionEstimate {
    /// TDOA から多辺測量で求めた位置
    Measured {
        position: Point2,
        /// 残差から求めた信頼度 (0.0 ~ 1.0)
        confidence: f64,
        /// レンジ差残差の RMS (m)
        residual_m: f64,
        /// 推定に使った TDOA（秒）
        tdoas: Vec<f64>,
        /// 既知の真値との距離（校正・テスト用）
        error_m: Option<f64>,
    },
    /// チャンネル不足時の模擬配置
    Simulated {
        position: Point2,
        /// 分類器の確率のみから決まる
        confidence: f64,
        error_m: Option<f64>,
    },
}

impl PositionEstimate {
    pub fn is_simulated(&self) -> bool {
        matches!(self, PositionEstimate::Simulated { .. })
    }

    pub fn position(&self) -> Point2 {
        match self {
            PositionEstimate::Measured { position, .. }
            | PositionEstimate::Simulated { position, .. } => *position,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            PositionEstimate::Measured { confidence, .. }
            | PositionEstimate::Simulated { confidence, .. } => *confidence,
        }
    }

    pub fn error_m(&self) -> Option<f64> {
        match self {
            PositionEstimate::Measured { error_m, .. }
            | PositionEstimate::Simulated { error_m, .. } => *error_m,
        }
    }

    /// 既知の真の位置との距離を記録する
    pub fn with_true_position(mut self, truth: Point2) -> Self {
        let distance = self.position().distance(&truth);
        match &mut self {
            PositionEstimate::Measured { error_m, .. }
            | PositionEstimate::Simulated { error_m, .. } => *error_m = Some(distance),
        }
        self
    }
}

/// JSON 出力時の表現
#[derive(Serialize)]
struct PositionView<'a> {
    estimated_position: Point2,
    simulated: bool,
    confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    residual_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tdoas: Option<&'a [f64]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_m: Option<f64>,
}

impl Serialize for PositionEstimate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let view = match self {
            PositionEstimate::Measured {
                position,
                confidence,
                residual_m,
                tdoas,
                error_m,
            } => PositionView {
                estimated_position: *position,
                simulated: false,
                confidence: *confidence,
                residual_m: Some(*residual_m),
                tdoas: Some(tdoas),
                error_m: *error_m,
            },
            PositionEstimate::Simulated {
                position,
                confidence,
                error_m,
            } => PositionView {
                estimated_position: *position,
                simulated: true,
                confidence: *confidence,
                residual_m: None,
                tdoas: None,
                error_m: *error_m,
            },
        };
        view.serialize(serializer)
    }
}

/// TDOA 多辺測量による2次元音源位置推定
///
/// # アルゴリズム
///
/// 基準マイクを原点に移し、マイク i のレンジ差を d_i = c·τ_i とすると
/// `2 m_i·p = |m_i|² − d_i² − 2 r0 d_i`（r0 は基準マイクからの距離）。
/// p = P + Q·r0 を最小二乗で求め、r0 = |p| の二次方程式を解く。
/// 各候補を Gauss-Newton で非線形残差
/// `|p − m_i| − |p| − d_i` について精密化し、RMS 残差最小のものを採用する。
///
/// 3マイクでは方程式数と未知数が等しく、残差は幾何の妥当性を示さない。
/// 候補が同程度の場合は遠い方（遠方音源の仮定）を選び、信頼度は半分にする。
#[derive(Clone, Debug)]
pub struct Localizer {
    array: MicrophoneArray,
    sound_speed: f64,
    simulated_center: Point2,
    simulated_extent: Point2,
}

impl Localizer {
    pub fn new(array: MicrophoneArray, sound_speed: f64) -> Self {
        let defaults = ArrayConfig::default();
        Self {
            array,
            sound_speed,
            simulated_center: defaults.simulated_center.into(),
            simulated_extent: defaults.simulated_extent.into(),
        }
    }

    pub fn from_config(config: &ArrayConfig) -> Self {
        Self::new(
            MicrophoneArray::new(config.microphone_positions()),
            config.sound_speed,
        )
        .with_simulation_area(config.simulated_center.into(), config.simulated_extent.into())
    }

    /// 模擬配置の範囲（中心と半幅）を設定
    ///
    /// 非有限の値は 0 として扱う。
    pub fn with_simulation_area(mut self, center: Point2, extent: Point2) -> Self {
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
        if ![center.x, center.y, extent.x, extent.y].iter().all(|v| v.is_finite()) {
            log::warn!(
                "模擬配置の範囲に非有限値があります: center={:?}, extent={:?}",
                center,
                extent
            );
        }
        self.simulated_center = Point2::new(finite(center.x), finite(center.y));
        self.simulated_extent = Point2::new(finite(extent.x).abs(), finite(extent.y).abs());
        self
    }

    pub fn array(&self) -> &MicrophoneArray {
        &self.array
    }

    pub fn sound_speed(&self) -> f64 {
        self.sound_speed
    }

    /// TDOA ベクトルから位置を推定
    ///
    /// # Errors
    ///
    /// - マイクが3個未満または一直線上: `DegenerateGeometry`
    /// - TDOA 数がマイク数 − 1 と一致しない、非有限値を含む: `InsufficientData`
    pub fn localize(&self, tdoa: &TdoaVector) -> Result<PositionEstimate> {
        let n = self.array.len();
        if n < 3 {
            return Err(DetectionError::DegenerateGeometry(format!(
                "マイクが {} 個しかありません",
                n
            )));
        }
        if self.array.is_collinear() {
            return Err(DetectionError::DegenerateGeometry(format!(
                "マイクが一直線上にあります: {:?}",
                self.array.positions()
            )));
        }
        if tdoa.reference >= n || tdoa.delays.len() != n - 1 {
            return Err(DetectionError::InsufficientData(format!(
                "TDOA 数 {} (基準 {}) がマイク数 {} と一致しません",
                tdoa.delays.len(),
                tdoa.reference,
                n
            )));
        }
        if tdoa.delays.iter().any(|d| !d.is_finite()) {
            return Err(DetectionError::InsufficientData(
                "TDOA に非有限値が含まれています".to_string(),
            ));
        }

        // 基準マイクを原点とした相対座標
        let origin = self.array.positions()[tdoa.reference];
        let mics: Vec<Point2> = self
            .array
            .positions()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != tdoa.reference)
            .map(|(_, p)| Point2::new(p.x - origin.x, p.y - origin.y))
            .collect();
        let ranges = tdoa.range_differences(self.sound_speed);

        let (p, q) = linear_solution(&mics, &ranges)?;

        let mut best: Option<(Point2, f64)> = None;
        for r0 in range_candidates(p, q, &ranges) {
            let start = Point2::new(p.x + q.x * r0, p.y + q.y * r0);
            let refined = refine(start, &mics, &ranges);
            let rms = rms_residual(refined, &mics, &ranges);
            log::trace!(
                "候補 r0={:.3}: ({:.3}, {:.3}) 残差 {:.2e}",
                r0,
                refined.x,
                refined.y,
                rms
            );

            best = match best {
                None => Some((refined, rms)),
                Some((current, current_rms)) => {
                    let tie = (rms - current_rms).abs() <= 1e-6;
                    let farther = refined.distance(&Point2::ORIGIN)
                        > current.distance(&Point2::ORIGIN);
                    if (tie && farther) || (!tie && rms < current_rms) {
                        Some((refined, rms))
                    } else {
                        Some((current, current_rms))
                    }
                }
            };
        }

        let Some((relative, residual_m)) = best else {
            return Err(DetectionError::InsufficientData(
                "TDOA と整合する解がありません".to_string(),
            ));
        };

        let mut confidence = (-residual_m / RESIDUAL_SCALE_M).exp();
        if n == 3 {
            confidence *= 0.5;
        }

        let position = Point2::new(relative.x + origin.x, relative.y + origin.y);
        log::debug!(
            "位置推定: ({:.3}, {:.3}) m 残差 {:.4} m 信頼度 {:.3}",
            position.x,
            position.y,
            residual_m,
            confidence
        );

        Ok(PositionEstimate::Measured {
            position,
            confidence,
            residual_m,
            tdoas: tdoa.delays.clone(),
            error_m: None,
        })
    }

    /// チャンネル不足時の模擬位置
    ///
    /// 同じ確率とシードからは常に同じ位置が得られる。
    pub fn simulate(&self, probability: f32, seed: u64) -> PositionEstimate {
        let mut rng = StdRng::seed_from_u64(seed ^ probability.to_bits() as u64);
        let ext = self.simulated_extent;
        let position = Point2::new(
            self.simulated_center.x + rng.gen_range(-ext.x..=ext.x),
            self.simulated_center.y + rng.gen_range(-ext.y..=ext.y),
        );
        PositionEstimate::Simulated {
            position,
            confidence: (probability as f64).clamp(0.0, 1.0),
            error_m: None,
        }
    }
}

/// 2 m_i·p = b0_i + b1_i·r0 を最小二乗で解き、p = P + Q·r0 の (P, Q) を返す
fn linear_solution(mics: &[Point2], ranges: &[f64]) -> Result<(Point2, Point2)> {
    let (mut a11, mut a12, mut a22) = (0.0, 0.0, 0.0);
    let (mut u0, mut v0, mut u1, mut v1) = (0.0, 0.0, 0.0, 0.0);
    for (m, &d) in mics.iter().zip(ranges) {
        let (ax, ay) = (2.0 * m.x, 2.0 * m.y);
        let b0 = m.x * m.x + m.y * m.y - d * d;
        let b1 = -2.0 * d;
        a11 += ax * ax;
        a12 += ax * ay;
        a22 += ay * ay;
        u0 += ax * b0;
        v0 += ay * b0;
        u1 += ax * b1;
        v1 += ay * b1;
    }
    let det = a11 * a22 - a12 * a12;
    if det.abs() < 1e-12 {
        return Err(DetectionError::DegenerateGeometry(
            "正規方程式が特異です".to_string(),
        ));
    }
    let solve = |u: f64, v: f64| Point2::new((a22 * u - a12 * v) / det, (a11 * v - a12 * u) / det);
    Ok((solve(u0, v0), solve(u1, v1)))
}

/// (|Q|² − 1) r0² + 2 P·Q r0 + |P|² = 0 の物理的に妥当な解
///
/// r0 ≥ 0 かつ全マイクまでの距離 r0 + d_i ≥ 0 を満たすもの。
/// 判別式が負（雑音で解が消えた）の場合は頂点を使う。
fn range_candidates(p: Point2, q: Point2, ranges: &[f64]) -> Vec<f64> {
    let a = q.x * q.x + q.y * q.y - 1.0;
    let b = 2.0 * (p.x * q.x + p.y * q.y);
    let c = p.x * p.x + p.y * p.y;

    let roots = if a.abs() < 1e-12 {
        if b.abs() < 1e-12 {
            vec![]
        } else {
            vec![-c / b]
        }
    } else {
        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            vec![-b / (2.0 * a)]
        } else {
            let sqrt = disc.sqrt();
            vec![(-b + sqrt) / (2.0 * a), (-b - sqrt) / (2.0 * a)]
        }
    };

    let valid: Vec<f64> = roots
        .iter()
        .copied()
        .filter(|&r0| r0 >= 0.0 && ranges.iter().all(|&d| r0 + d >= -1e-9))
        .collect();
    if valid.is_empty() {
        // どれも条件を満たさない場合は最も近い妥当点から精密化する
        roots.into_iter().map(|r0| r0.max(0.0)).collect()
    } else {
        valid
    }
}

fn residuals(p: Point2, mics: &[Point2], ranges: &[f64]) -> Vec<f64> {
    let r0 = p.distance(&Point2::ORIGIN);
    mics.iter()
        .zip(ranges)
        .map(|(m, &d)| p.distance(m) - r0 - d)
        .collect()
}

fn rms_residual(p: Point2, mics: &[Point2], ranges: &[f64]) -> f64 {
    let r = residuals(p, mics, ranges);
    (r.iter().map(|v| v * v).sum::<f64>() / r.len() as f64).sqrt()
}

/// 非線形レンジ差方程式の Gauss-Newton 精密化
fn refine(start: Point2, mics: &[Point2], ranges: &[f64]) -> Point2 {
    let cost = |p: Point2| -> f64 { residuals(p, mics, ranges).iter().map(|v| v * v).sum() };

    let mut p = start;
    let mut current = cost(p);
    for _ in 0..MAX_ITERATIONS {
        let r0 = p.distance(&Point2::ORIGIN).max(1e-12);
        let (mut j11, mut j12, mut j22, mut g1, mut g2) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (m, f) in mics.iter().zip(residuals(p, mics, ranges)) {
            let ri = p.distance(m).max(1e-12);
            let jx = (p.x - m.x) / ri - p.x / r0;
            let jy = (p.y - m.y) / ri - p.y / r0;
            j11 += jx * jx;
            j12 += jx * jy;
            j22 += jy * jy;
            g1 += jx * f;
            g2 += jy * f;
        }
        let det = j11 * j22 - j12 * j12;
        if det.abs() < 1e-18 {
            break;
        }
        let dx = -(j22 * g1 - j12 * g2) / det;
        let dy = -(j11 * g2 - j12 * g1) / det;
        let next = Point2::new(p.x + dx, p.y + dy);
        let next_cost = cost(next);
        if !next_cost.is_finite() || next_cost >= current {
            break;
        }
        p = next;
        current = next_cost;
        if dx.hypot(dy) < 1e-10 {
            break;
        }
    }
    p
}
