use crate::types::{AudioBlock, AudioBuffer, AudioFormat};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// `read_block` の結果
#[derive(Debug)]
pub enum SourceRead {
    Block(AudioBlock),
    /// タイムアウトまでにデータが届かなかった
    Timeout,
    /// 入力の終端（ファイル再生の終了など）
    Finished,
}

/// リアルタイム監視の入力源
///
/// 監視スレッド上で生成・使用されるため `Send` は要求しない
/// （cpal のストリームはプラットフォームによってスレッド間移動できない）。
pub trait AudioSource {
    /// 入力を開き、実際のフォーマットを返す
    fn open(&mut self) -> Result<AudioFormat>;

    /// 1ブロック読み込む
    fn read_block(&mut self, timeout: Duration) -> Result<SourceRead>;

    /// 入力を閉じる（複数回呼んでもよい）
    fn close(&mut self);
}

/// 監視スレッド内で入力源を生成するファクトリ
pub type SourceFactory = Arc<dyn Fn() -> Result<Box<dyn AudioSource>> + Send + Sync>;

/// 現在時刻 (UNIX_EPOCH からのナノ秒)
pub fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// 録音済みバッファをブロック単位で再生する入力源
///
/// `realtime` が有効な場合はブロックの長さだけ待ってから返し、
/// ライブ入力と同じペースで流す。
pub struct ReplaySource {
    buffer: AudioBuffer,
    block_frames: usize,
    realtime: bool,
    position: usize,
    opened_at: Option<(Instant, u128)>,
}

impl ReplaySource {
    pub fn new(buffer: AudioBuffer, block_frames: usize, realtime: bool) -> Self {
        Self {
            buffer,
            block_frames: block_frames.max(1),
            realtime,
            position: 0,
            opened_at: None,
        }
    }
}

impl AudioSource for ReplaySource {
    fn open(&mut self) -> Result<AudioFormat> {
        self.position = 0;
        self.opened_at = Some((Instant::now(), now_ns()));
        log::info!(
            "再生入力を開始: {:.1}秒, {}ch, {}Hz",
            self.buffer.duration_secs(),
            self.buffer.channel_count(),
            self.buffer.sample_rate()
        );
        Ok(self.buffer.format())
    }

    fn read_block(&mut self, timeout: Duration) -> Result<SourceRead> {
        let Some((started, started_ns)) = self.opened_at else {
            anyhow::bail!("再生入力が開かれていません");
        };
        if self.position >= self.buffer.frames() {
            return Ok(SourceRead::Finished);
        }

        let sample_rate = self.buffer.sample_rate() as u64;
        let end = (self.position + self.block_frames).min(self.buffer.frames());

        if self.realtime {
            // ブロック末尾の時刻まで待つ
            let due = started + Duration::from_nanos(end as u64 * 1_000_000_000 / sample_rate);
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(SourceRead::Timeout);
                }
                std::thread::sleep(wait);
            }
        }

        let samples = self
            .buffer
            .channels()
            .iter()
            .map(|ch| ch[self.position..end].to_vec())
            .collect();
        let timestamp_ns =
            started_ns + self.position as u128 * 1_000_000_000 / sample_rate as u128;
        self.position = end;

        Ok(SourceRead::Block(AudioBlock {
            samples,
            timestamp_ns,
        }))
    }

    fn close(&mut self) {
        self.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> AudioBuffer {
        AudioBuffer::new(vec![(0..2500).map(|i| i as f32).collect(); 2], 1000).unwrap()
    }

    #[test]
    fn test_replay_blocks() {
        let mut source = ReplaySource::new(buffer(), 1000, false);
        let format = source.open().unwrap();
        assert_eq!(format.channels, 2);
        assert_eq!(format.sample_rate, 1000);

        let mut frames = Vec::new();
        let mut timestamps = Vec::new();
        loop {
            match source.read_block(Duration::from_millis(10)).unwrap() {
                SourceRead::Block(block) => {
                    frames.push(block.frames());
                    timestamps.push(block.timestamp_ns);
                    assert_eq!(block.samples.len(), 2);
                }
                SourceRead::Finished => break,
                SourceRead::Timeout => panic!("ペーシングなしでタイムアウト"),
            }
        }
        assert_eq!(frames, vec![1000, 1000, 500]);
        assert_eq!(timestamps[1] - timestamps[0], 1_000_000_000);
    }

    #[test]
    fn test_read_before_open_fails() {
        let mut source = ReplaySource::new(buffer(), 1000, false);
        assert!(source.read_block(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_realtime_pacing() {
        let buffer = AudioBuffer::new(vec![vec![0.0; 100]; 3], 1000).unwrap();
        let mut source = ReplaySource::new(buffer, 50, true);
        source.open().unwrap();

        let start = Instant::now();
        let mut blocks = 0;
        while blocks < 2 {
            if let SourceRead::Block(_) = source.read_block(Duration::from_millis(500)).unwrap() {
                blocks += 1;
            }
        }
        // 100フレーム @ 1kHz = 100ms
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
