use crate::config::DetectionConfig;
use crate::error::{DetectionError, Result};
use crate::types::{AudioBuffer, Segment};

/// 音声バッファを固定長の解析セグメントに分割する
///
/// - 長時間解析が無効、または長さが `long_audio_min_secs` 以下:
///   先頭から min(長さ, セグメント長) の1セグメントのみ
/// - 長時間解析が有効かつ長い音声: セグメント長・オーバーラップ率で
///   スライドさせ、末尾はパディングせず切り詰める。
///   `min_tail_secs` より短い末尾は破棄する。
#[derive(Clone, Debug)]
pub struct SegmentWindower {
    segment_duration_secs: f64,
    overlap: f64,
    long_audio_min_secs: f64,
    min_tail_secs: f64,
}

impl SegmentWindower {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            segment_duration_secs: config.segment_duration_secs,
            overlap: config.overlap,
            long_audio_min_secs: config.long_audio_min_secs,
            min_tail_secs: config.min_tail_secs,
        }
    }

    /// セグメント長（秒）
    pub fn segment_duration_secs(&self) -> f64 {
        self.segment_duration_secs
    }

    /// セグメント長（サンプル）
    pub fn segment_samples(&self, sample_rate: u32) -> usize {
        ((self.segment_duration_secs * sample_rate as f64).round() as usize).max(1)
    }

    /// セグメント間のストライド（サンプル）
    pub fn stride_samples(&self, sample_rate: u32) -> usize {
        let segment = self.segment_samples(sample_rate);
        ((segment as f64 * (1.0 - self.overlap)).round() as usize).clamp(1, segment)
    }

    /// セグメント列を生成
    ///
    /// 返されるイテレータは遅延評価で、`clone()` すれば先頭からやり直せる。
    ///
    /// # Errors
    ///
    /// バッファが空の場合に `InvalidAudio` を返す。
    pub fn segments(&self, buffer: &AudioBuffer, analyze_long: bool) -> Result<Segments> {
        if buffer.is_empty() {
            return Err(DetectionError::InvalidAudio(
                "音声データが空です".to_string(),
            ));
        }

        let sample_rate = buffer.sample_rate();
        let total = buffer.frames();
        let segment = self.segment_samples(sample_rate);
        let long = analyze_long && buffer.duration_secs() > self.long_audio_min_secs;

        Ok(Segments {
            sample_rate,
            total,
            segment,
            stride: self.stride_samples(sample_rate),
            min_tail: (self.min_tail_secs * sample_rate as f64).round() as usize,
            long,
            next_start: 0,
            index: 0,
            done: false,
        })
    }
}

/// SegmentWindower が生成するセグメント列
#[derive(Clone, Debug)]
pub struct Segments {
    sample_rate: u32,
    total: usize,
    segment: usize,
    stride: usize,
    min_tail: usize,
    long: bool,
    next_start: usize,
    index: usize,
    done: bool,
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.done {
            return None;
        }

        if !self.long {
            // 単一セグメントモード
            self.done = true;
            let end = self.segment.min(self.total);
            return Some(Segment::new(0, 0, end, self.sample_rate));
        }

        let start = self.next_start;
        if start >= self.total {
            self.done = true;
            return None;
        }

        let end = (start + self.segment).min(self.total);
        if end == self.total {
            // バッファ末尾に到達したら以降は生成しない
            self.done = true;
            if end - start < self.segment && end - start < self.min_tail && self.index > 0 {
                log::debug!(
                    "短い末尾セグメントを破棄: {:.3}秒",
                    (end - start) as f64 / self.sample_rate as f64
                );
                return None;
            }
        }

        let segment = Segment::new(self.index, start, end, self.sample_rate);
        self.index += 1;
        self.next_start = start + self.stride;
        Some(segment)
    }
}
