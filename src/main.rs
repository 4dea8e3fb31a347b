use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use dronewatch::analyzer::DroneAnalyzer;
use dronewatch::audio_input::CpalSource;
use dronewatch::classifier::TonalityClassifier;
use dronewatch::config::Config;
use dronewatch::monitor::{MonitorEvent, RealTimeMonitor};
use dronewatch::source::{AudioSource, ReplaySource, SourceFactory};
use dronewatch::wav_reader;
use env_logger::Env;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

const DEFAULT_CONFIG: &str = "config.toml";

fn init_logger(level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str);

    // デバイス一覧表示モード
    if mode == Some("--show-interfaces") {
        init_logger("info");
        CpalSource::list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if mode == Some("--generate-config") {
        let config_path = args.get(2).map(String::as_str).unwrap_or(DEFAULT_CONFIG);
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // ファイル解析モード（複数ファイル可）
    if mode == Some("--analyze") {
        let (wav_paths, config_path) = parse_analyze_args(&args[2..])?;
        let config = Config::load_or_default(config_path.unwrap_or(DEFAULT_CONFIG))?;
        init_logger(&config.output.log_level);
        return analyze_files(&config, &wav_paths);
    }

    // 再生モード（ファイルをリアルタイム監視に流す）
    if mode == Some("--replay") {
        let wav_path = args.get(2).context("使い方: dronewatch --replay <file.wav> [config]")?;
        let config = Config::load_or_default(args.get(3).map(String::as_str).unwrap_or(DEFAULT_CONFIG))?;
        init_logger(&config.output.log_level);

        let buffer = wav_reader::load_wav(wav_path)?;
        let block_frames = config.audio.block_size as usize;
        let factory: SourceFactory = Arc::new(move || {
            Ok(Box::new(ReplaySource::new(buffer.clone(), block_frames, true)) as Box<dyn AudioSource>)
        });
        return run_monitor(config, factory);
    }

    // ライブ監視モード
    let config_path = match mode {
        Some(arg) if !arg.starts_with("--") => arg,
        _ => DEFAULT_CONFIG,
    };
    let config = Config::load_or_default(config_path)?;
    init_logger(&config.output.log_level);

    let audio = config.audio.clone();
    let queue_blocks = config.buffer.queue_blocks;
    let factory: SourceFactory = Arc::new(move || {
        Ok(Box::new(CpalSource::new(&audio, queue_blocks)) as Box<dyn AudioSource>)
    });
    run_monitor(config, factory)
}

/// `--analyze` の引数を WAV ファイル群と設定ファイルに分ける
///
/// 設定ファイルは `--config <path>`、または拡張子 `.toml` の引数で指定する。
fn parse_analyze_args(args: &[String]) -> Result<(Vec<&str>, Option<&str>)> {
    let mut wav_paths = Vec::new();
    let mut config_path = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .context("--config の後に設定ファイルを指定してください")?;
            config_path = Some(path.as_str());
        } else if arg.ends_with(".toml") {
            config_path = Some(arg.as_str());
        } else {
            wav_paths.push(arg.as_str());
        }
    }
    anyhow::ensure!(
        !wav_paths.is_empty(),
        "使い方: dronewatch --analyze <file.wav>... [--config <config.toml>]"
    );
    Ok((wav_paths, config_path))
}

fn analyze_files(config: &Config, wav_paths: &[&str]) -> Result<()> {
    let analyzer = DroneAnalyzer::new(config, Arc::new(TonalityClassifier::default()));
    let reports = analyzer.analyze_files(
        wav_paths,
        config.detection.threshold,
        config.detection.analyze_long,
    );

    // 1ファイルなら整形して、複数なら JSON Lines で出力
    for report in &reports {
        let json = if reports.len() == 1 {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        println!("{}", json);
    }

    anyhow::ensure!(
        reports.iter().any(|r| r.is_success()),
        "すべてのファイルの解析に失敗しました"
    );
    Ok(())
}

fn run_monitor(config: Config, factory: SourceFactory) -> Result<()> {
    log::info!("dronewatch を起動します");
    log::debug!("設定: {:?}", config);

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    let status_interval = Duration::from_secs(config.output.status_interval_secs.max(1));
    let analyzer = Arc::new(DroneAnalyzer::new(
        &config,
        Arc::new(TonalityClassifier::default()),
    ));
    let monitor = RealTimeMonitor::new(config, analyzer, factory);
    let events = monitor.events();

    monitor.start()?;
    log::info!("監視を開始しました (Ctrl+C で停止)");

    // メインループ: イベントを JSON Lines で出力
    let mut last_status = Instant::now();
    let mut finished = false;
    while running.load(Ordering::SeqCst) && !finished {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                finished = matches!(event, MonitorEvent::MonitoringStopped { .. });
                print_event(&event);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_status.elapsed() >= status_interval {
            let status = monitor.status();
            log::info!(
                "状態: 稼働 {:.0}秒, {}ch, 検出 {} 件",
                status.uptime_secs,
                status.channels,
                status.detections
            );
            last_status = Instant::now();
        }
    }

    // クリーンアップ
    log::info!("停止処理を開始します...");
    monitor.stop();
    for event in events.try_iter() {
        print_event(&event);
    }

    log::info!("dronewatch を終了しました");
    Ok(())
}

fn print_event(event: &MonitorEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("イベントのシリアライズに失敗: {}", e),
    }
}
