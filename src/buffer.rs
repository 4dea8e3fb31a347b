use crate::config::BufferConfig;
use crate::error::{DetectionError, Result};
use crate::types::{AudioBlock, AudioBuffer, DropPolicy};
use std::collections::VecDeque;

/// ローリングバッファから切り出した解析ウィンドウ
#[derive(Clone, Debug)]
pub struct AnalysisWindow {
    pub buffer: AudioBuffer,
    /// 先頭フレームのタイムスタンプ (UNIX_EPOCH からのナノ秒)
    pub timestamp_ns: u128,
}

/// リアルタイム監視用のマルチチャンネル・ローリングバッファ
///
/// ライブ入力のブロックを蓄積し、解析ウィンドウ分たまったら切り出す。
/// 切り出し後はストライド分だけ先頭を消費し、残りは次のウィンドウとの
/// オーバーラップとして保持する。容量を超えた場合はドロップポリシーに従う。
pub struct RollingBuffer {
    capacity_frames: usize,
    drop_policy: DropPolicy,
    blocks: VecDeque<AudioBlock>,
    total_frames: usize,
    channels: usize,
    sample_rate: u32,
}

impl RollingBuffer {
    pub fn new(config: &BufferConfig, channels: usize, sample_rate: u32) -> Self {
        let capacity_frames = config.capacity_seconds as usize * sample_rate as usize;
        if config.drop_policy == DropPolicy::Block {
            // キャプチャは止められないため DropOldest として処理
            log::warn!("Block ポリシーは未実装: DropOldest として処理します");
        }
        Self {
            capacity_frames,
            drop_policy: config.drop_policy,
            blocks: VecDeque::new(),
            total_frames: 0,
            channels,
            sample_rate,
        }
    }

    /// ブロックを追加
    ///
    /// # Errors
    ///
    /// チャンネル数が異なる、またはチャンネル間で長さが揃っていないブロックは
    /// `InvalidAudio` として拒否する（バッファは変更されない）。
    pub fn push(&mut self, block: AudioBlock) -> Result<()> {
        if block.samples.len() != self.channels {
            return Err(DetectionError::InvalidAudio(format!(
                "ブロックのチャンネル数 {} が入力チャンネル数 {} と一致しません",
                block.samples.len(),
                self.channels
            )));
        }
        let frames = block.frames();
        if block.samples.iter().any(|ch| ch.len() != frames) {
            return Err(DetectionError::InvalidAudio(
                "ブロック内のチャンネル長が揃っていません".to_string(),
            ));
        }
        if frames == 0 {
            return Ok(());
        }

        self.total_frames += frames;
        self.blocks.push_back(block);

        // 容量オーバーの場合、ドロップポリシーに従って処理
        while self.total_frames > self.capacity_frames {
            let dropped = match self.drop_policy {
                DropPolicy::DropOldest | DropPolicy::Block => self.blocks.pop_front(),
                DropPolicy::DropNewest => self.blocks.pop_back(),
            };
            match dropped {
                Some(block) => {
                    self.total_frames -= block.frames();
                    log::debug!("バッファ容量超過: {} フレームを破棄", block.frames());
                }
                None => break,
            }
        }
        Ok(())
    }

    /// ウィンドウ長分たまっていれば先頭から切り出し、ストライド分を消費する
    pub fn next_window(&mut self, window_frames: usize, stride_frames: usize) -> Option<AnalysisWindow> {
        if window_frames == 0 || self.total_frames < window_frames {
            return None;
        }
        let timestamp_ns = self.blocks.front()?.timestamp_ns;

        let mut channels = vec![Vec::with_capacity(window_frames); self.channels];
        let mut remaining = window_frames;
        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(block.frames());
            for (dst, src) in channels.iter_mut().zip(&block.samples) {
                dst.extend_from_slice(&src[..take]);
            }
            remaining -= take;
        }

        self.consume(stride_frames.min(window_frames));

        match AudioBuffer::new(channels, self.sample_rate) {
            Ok(buffer) => Some(AnalysisWindow {
                buffer,
                timestamp_ns,
            }),
            Err(e) => {
                log::error!("ウィンドウの作成に失敗: {}", e);
                None
            }
        }
    }

    /// 先頭から指定フレーム数を捨てる
    fn consume(&mut self, mut frames: usize) {
        while frames > 0 {
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            let len = front.frames();
            if len <= frames {
                frames -= len;
                self.total_frames -= len;
                self.blocks.pop_front();
            } else {
                for ch in front.samples.iter_mut() {
                    ch.drain(..frames);
                }
                front.timestamp_ns += frames as u128 * 1_000_000_000 / self.sample_rate as u128;
                self.total_frames -= frames;
                frames = 0;
            }
        }
    }

    /// バッファ内のフレーム数
    pub fn len(&self) -> usize {
        self.total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.total_frames == 0
    }

    /// バッファ内のデータ時間（秒）
    pub fn duration_seconds(&self) -> f64 {
        self.total_frames as f64 / self.sample_rate as f64
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.total_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity_seconds: u32, drop_policy: DropPolicy) -> BufferConfig {
        BufferConfig {
            capacity_seconds,
            drop_policy,
            ..BufferConfig::default()
        }
    }

    /// 値 `value` で埋めた2チャンネルブロック
    fn block(frames: usize, value: f32, timestamp_ns: u128) -> AudioBlock {
        AudioBlock {
            samples: vec![vec![value; frames], vec![-value; frames]],
            timestamp_ns,
        }
    }

    #[test]
    fn test_push_and_capacity() {
        let mut buffer = RollingBuffer::new(&config(1, DropPolicy::DropOldest), 2, 1000);

        buffer.push(block(500, 1.0, 0)).unwrap();
        buffer.push(block(500, 2.0, 500_000_000)).unwrap();
        assert_eq!(buffer.len(), 1000);

        // 容量オーバー: 最古が削除される
        buffer.push(block(500, 3.0, 1_000_000_000)).unwrap();
        assert_eq!(buffer.len(), 1000);
        let window = buffer.next_window(1000, 1000).unwrap();
        assert_eq!(window.buffer.channel(0).unwrap()[0], 2.0);
        assert_eq!(window.timestamp_ns, 500_000_000);
    }

    #[test]
    fn test_drop_newest() {
        let mut buffer = RollingBuffer::new(&config(1, DropPolicy::DropNewest), 2, 1000);
        buffer.push(block(600, 1.0, 0)).unwrap();
        buffer.push(block(600, 2.0, 600_000_000)).unwrap();
        assert_eq!(buffer.len(), 600);

        buffer.push(block(400, 3.0, 1_200_000_000)).unwrap();
        let window = buffer.next_window(1000, 1000).unwrap();
        assert_eq!(window.buffer.channel(0).unwrap()[0], 1.0);
        assert_eq!(window.buffer.channel(0).unwrap()[999], 3.0);
    }

    #[test]
    fn test_block_policy_drops_oldest() {
        let mut buffer = RollingBuffer::new(&config(1, DropPolicy::Block), 2, 1000);
        for i in 0..10 {
            buffer.push(block(250, i as f32, i as u128 * 250_000_000)).unwrap();
        }
        assert_eq!(buffer.len(), 1000);
        let window = buffer.next_window(1000, 1000).unwrap();
        assert_eq!(window.buffer.channel(0).unwrap()[0], 6.0);
        assert_eq!(window.timestamp_ns, 1_500_000_000);
    }

    #[test]
    fn test_overlapping_windows() {
        let mut buffer = RollingBuffer::new(&config(10, DropPolicy::DropOldest), 2, 1000);

        // 0.25秒ブロックで 2.9秒分: まだ3秒に満たない
        for i in 0..11 {
            buffer.push(block(250, i as f32, i as u128 * 250_000_000)).unwrap();
        }
        assert!(buffer.next_window(3000, 1500).is_none());

        buffer.push(block(250, 11.0, 2_750_000_000)).unwrap();
        let first = buffer.next_window(3000, 1500).unwrap();
        assert_eq!(first.buffer.frames(), 3000);
        assert_eq!(first.timestamp_ns, 0);
        // ストライド分だけ消費し、残りはオーバーラップとして保持
        assert_eq!(buffer.len(), 1500);
        assert!(buffer.next_window(3000, 1500).is_none());

        for i in 12..18 {
            buffer.push(block(250, i as f32, i as u128 * 250_000_000)).unwrap();
        }
        let second = buffer.next_window(3000, 1500).unwrap();
        assert_eq!(second.timestamp_ns, 1_500_000_000);
        // 1.5秒目はブロック6の先頭
        assert_eq!(second.buffer.channel(0).unwrap()[0], 6.0);
        assert_eq!(second.buffer.channel(1).unwrap()[0], -6.0);
        assert_eq!(first.buffer.channel(0).unwrap()[1500], 6.0);
    }

    #[test]
    fn test_partial_block_consumption() {
        let mut buffer = RollingBuffer::new(&config(10, DropPolicy::DropOldest), 2, 1000);
        buffer.push(block(700, 1.0, 0)).unwrap();
        buffer.push(block(700, 2.0, 700_000_000)).unwrap();

        let window = buffer.next_window(1000, 500).unwrap();
        assert_eq!(window.buffer.frames(), 1000);
        assert_eq!(buffer.len(), 900);

        // 先頭ブロックは途中から始まり、タイムスタンプも進む
        let next = buffer.next_window(900, 900).unwrap();
        assert_eq!(next.timestamp_ns, 500_000_000);
        assert_eq!(next.buffer.channel(0).unwrap()[0], 1.0);
        assert_eq!(next.buffer.channel(0).unwrap()[200], 2.0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_malformed_block_rejected() {
        let mut buffer = RollingBuffer::new(&config(10, DropPolicy::DropOldest), 2, 1000);
        let mono = AudioBlock {
            samples: vec![vec![0.0; 100]],
            timestamp_ns: 0,
        };
        assert!(matches!(
            buffer.push(mono),
            Err(DetectionError::InvalidAudio(_))
        ));
        let ragged = AudioBlock {
            samples: vec![vec![0.0; 100], vec![0.0; 99]],
            timestamp_ns: 0,
        };
        assert!(buffer.push(ragged).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut buffer = RollingBuffer::new(&config(10, DropPolicy::DropOldest), 2, 1000);
        buffer.push(block(1500, 1.0, 0)).unwrap();
        assert!((buffer.duration_seconds() - 1.5).abs() < 1e-9);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }
}
