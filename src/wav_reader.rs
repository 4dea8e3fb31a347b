use crate::types::AudioBuffer;
use anyhow::{Context, Result};
use std::path::Path;

/// WAVファイルをマルチチャンネルバッファとして読み込む
///
/// 整数PCM (8/16/24/32bit) と 32bit 浮動小数点に対応し、
/// サンプルは -1.0 ~ 1.0 に正規化される。
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("WAVファイルを開けません: {:?}", path))?;
    let spec = reader.spec();

    log::info!(
        "WAVファイル読み込み: {:?} ({}Hz, {}ch, {}bit {:?})",
        path,
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample,
        spec.sample_format
    );

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("サンプルの読み込みに失敗: {:?}", path))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v as f32 * scale).clamp(-1.0, 1.0)))
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("サンプルの読み込みに失敗: {:?}", path))?
        }
    };

    let buffer = AudioBuffer::from_interleaved(&interleaved, spec.channels, spec.sample_rate)?;
    log::info!("読み込み完了: {:.2}秒", buffer.duration_secs());
    Ok(buffer)
}

/// バッファを 16bit PCM の WAV ファイルとして書き出す
pub fn write_wav<P: AsRef<Path>>(path: P, buffer: &AudioBuffer) -> Result<()> {
    let path = path.as_ref();
    let spec = hound::WavSpec {
        channels: buffer.channel_count() as u16,
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("WAVファイルの作成に失敗: {:?}", path))?;

    for frame in 0..buffer.frames() {
        for channel in buffer.channels() {
            let sample = (channel[frame].clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(sample)
                .with_context(|| "WAVファイルへのサンプル書き込みに失敗")?;
        }
    }

    writer
        .finalize()
        .with_context(|| "WAVファイルのファイナライズに失敗")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_load_multichannel() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("array.wav");

        let channels = vec![
            vec![0.0, 0.5, -0.5, 0.25],
            vec![0.1, 0.2, 0.3, 0.4],
            vec![-1.0, 1.0, 0.0, 0.0],
        ];
        let buffer = AudioBuffer::new(channels.clone(), 22050).unwrap();
        write_wav(&path, &buffer).unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate(), 22050);
        assert_eq!(loaded.channel_count(), 3);
        assert_eq!(loaded.frames(), 4);
        for (ch, expected) in channels.iter().enumerate() {
            for (a, b) in loaded.channel(ch).unwrap().iter().zip(expected) {
                assert!((a - b).abs() < 1e-3, "channel {}: {} != {}", ch, a, b);
            }
        }
    }

    #[test]
    fn test_load_float_wav() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [0.0f32, 0.75, -0.75] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.channel(0).unwrap(), &[0.0, 0.75, -0.75]);
    }

    #[test]
    fn test_missing_file() {
        assert!(load_wav("nonexistent.wav").is_err());
    }
}
