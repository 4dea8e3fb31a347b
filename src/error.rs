use thiserror::Error;

/// 検出・位置推定パイプラインのエラー
///
/// 「ドローン未検出」は正常な結果であり、ここには含まれない。
/// このエラーは「解析できなかった」ことを表す。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    /// サンプリングレートやチャンネル数が不正
    #[error("不正な音声データ: {0}")]
    InvalidAudio(String),

    /// セグメントから特徴量を計算できない
    #[error("特徴量抽出に失敗: {0}")]
    FeatureExtraction(String),

    /// 分類器がエラーまたは範囲外の確率を返した（セグメント単位で隔離される）
    #[error("分類に失敗: {0}")]
    Classification(String),

    /// 全セグメントの分類に失敗した
    #[error("有効なセグメントがありません (全 {total} セグメントが失敗)")]
    NoValidSegments { total: usize },

    /// TDOAとチャンネル数・マイク数が一致しない
    #[error("データ不足: {0}")]
    InsufficientData(String),

    /// マイク配置から2次元位置が一意に決まらない
    #[error("マイク配置が縮退しています: {0}")]
    DegenerateGeometry(String),

    /// モニタリングが既に実行中
    #[error("モニタリングは既に実行中です")]
    AlreadyRunning,

    /// モニタリングが実行されていない
    #[error("モニタリングは実行されていません")]
    NotRunning,

    /// リトライ後も入力デバイスを利用できない
    #[error("入力デバイスを利用できません: {0}")]
    DeviceUnavailable(String),
}

pub type Result<T> = std::result::Result<T, DetectionError>;
