use crate::config::AudioConfig;
use crate::source::{now_ns, AudioSource, SourceRead};
use crate::types::{AudioBlock, AudioFormat};
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use regex_lite::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 入力デバイスとして利用してはいけないデバイス名
const EXCLUDED_DEVICES: &str =
    "MacBook (Air|Pro)|AirPods|iPhone|Webcam|Background|Microsoft Teams|ZoomAudioDevice";

/// オーディオデバイスからのマルチチャンネル音声入力
///
/// cpal のコールバックでデインターリーブしたブロックを有界キューに積む。
/// キューが満杯の場合は最古のブロックを捨てて新しいブロックを入れる
/// （ライブ音声は巻き戻せないため、キャプチャは止めない）。
pub struct CpalSource {
    config: AudioConfig,
    queue_blocks: usize,
    stream: Option<cpal::Stream>,
    receiver: Option<Receiver<AudioBlock>>,
    stream_error: Arc<Mutex<Option<String>>>,
}

impl CpalSource {
    pub fn new(config: &AudioConfig, queue_blocks: usize) -> Self {
        Self {
            config: config.clone(),
            queue_blocks: queue_blocks.max(1),
            stream: None,
            receiver: None,
            stream_error: Arc::new(Mutex::new(None)),
        }
    }

    fn find_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if self.config.device_id == "default" {
            host.default_input_device()
                .context("デフォルト入力デバイスが見つかりません")
        } else {
            // デバイスIDが指定されている場合は、デバイス一覧から検索
            Self::input_devices()?
                .into_iter()
                .find(|d| d.name().ok().as_deref() == Some(self.config.device_id.as_str()))
                .with_context(|| format!("デバイスが見つかりません: {}", self.config.device_id))
        }
    }

    /// ストリームを構築
    fn build_stream<T>(
        &self,
        device: &cpal::Device,
        stream_config: &cpal::StreamConfig,
        sender: Sender<AudioBlock>,
        overflow: Receiver<AudioBlock>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let num_channels = stream_config.channels as usize;

        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            // タイムスタンプを取得（全チャンネルで共有）
            let timestamp_ns = now_ns();

            // インターリーブされたデータを各チャンネルに分離
            let frames = data.len() / num_channels;
            let mut samples = vec![Vec::with_capacity(frames); num_channels];
            for frame in data.chunks_exact(num_channels) {
                for (ch, sample) in frame.iter().enumerate() {
                    let f: f32 = sample.to_float_sample().into();
                    samples[ch].push(f.clamp(-1.0, 1.0));
                }
            }

            let block = AudioBlock {
                samples,
                timestamp_ns,
            };

            // 非同期送信（ブロッキングしない）
            match sender.try_send(block) {
                Ok(_) => {}
                Err(TrySendError::Full(block)) => {
                    // 最古のブロックを捨てて入れ直す
                    let _ = overflow.try_recv();
                    if sender.try_send(block).is_err() {
                        log::warn!("キャプチャキューへの送信失敗: ブロックを破棄");
                    } else {
                        log::debug!("キャプチャキュー満杯: 最古のブロックを破棄");
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::warn!("キャプチャキューへの送信失敗: 受信側がクローズ");
                }
            }
        };

        let stream_error = self.stream_error.clone();
        let error_callback = move |err: cpal::StreamError| {
            log::error!("ストリームエラー: {}", err);
            *stream_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
        };

        let stream = device
            .build_input_stream(stream_config, data_callback, error_callback, None)
            .context("入力ストリームの構築に失敗")?;

        Ok(stream)
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in Self::input_devices()?.into_iter().enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }

    /// 内蔵マイク・WebCam など、アレイ入力として利用してはいけないデバイスを除外したデバイス一覧を取得
    fn input_devices() -> Result<Vec<cpal::Device>> {
        let host = cpal::default_host();
        let excluded = Regex::new(EXCLUDED_DEVICES).context("除外デバイスの正規表現が不正です")?;
        let devices = host
            .input_devices()?
            .filter(|device| match device.name() {
                Ok(name) => !excluded.is_match(&name),
                Err(_) => true,
            })
            .collect();
        Ok(devices)
    }
}

impl AudioSource for CpalSource {
    fn open(&mut self) -> Result<AudioFormat> {
        self.close();

        let device = self.find_device()?;
        log::info!("入力デバイス: {:?}", device.name());

        let default_config = device
            .default_input_config()
            .context("デフォルト入力設定が取得できません")?;
        log::info!(
            "デバイス設定: {:?}, {}Hz, {}ch",
            default_config.sample_format(),
            default_config.sample_rate().0,
            default_config.channels()
        );

        let stream_config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.config.block_size),
        };

        let (tx, rx) = crossbeam_channel::bounded(self.queue_blocks);
        let overflow = rx.clone();
        *self.stream_error.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                self.build_stream::<f32>(&device, &stream_config, tx, overflow)?
            }
            cpal::SampleFormat::I16 => {
                self.build_stream::<i16>(&device, &stream_config, tx, overflow)?
            }
            cpal::SampleFormat::U16 => {
                self.build_stream::<u16>(&device, &stream_config, tx, overflow)?
            }
            cpal::SampleFormat::I32 => {
                self.build_stream::<i32>(&device, &stream_config, tx, overflow)?
            }
            other => anyhow::bail!("サポートされていないサンプルフォーマット: {:?}", other),
        };

        stream.play().context("ストリームの再生開始に失敗")?;
        self.stream = Some(stream);
        self.receiver = Some(rx);

        log::info!("音声入力ストリームを開始しました");

        Ok(AudioFormat {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
        })
    }

    fn read_block(&mut self, timeout: Duration) -> Result<SourceRead> {
        let pending = self
            .stream_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(err) = pending {
            anyhow::bail!("入力ストリームエラー: {}", err);
        }

        let receiver = self
            .receiver
            .as_ref()
            .context("入力ストリームが開かれていません")?;
        match receiver.recv_timeout(timeout) {
            Ok(block) => Ok(SourceRead::Block(block)),
            Err(RecvTimeoutError::Timeout) => Ok(SourceRead::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("入力ストリームが切断されました")
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("音声入力ストリームを停止しました");
        }
        self.receiver = None;
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}
