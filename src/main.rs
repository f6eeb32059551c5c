use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use parley_gateway::agent::ChatCompletionsSource;
use parley_gateway::api::ApiServer;
use parley_gateway::session::TurnServices;
use parley_gateway::voice::{
    AsrClient, AudioSink, Recognizer, ReplySpeaker, TtsClient, read_wav, write_wav,
};
use parley_gateway::Config;

/// Parley - real-time voice assistant gateway
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "PARLEY_PORT")]
    port: Option<u16>,

    /// Directory with the web client (overrides config)
    #[arg(long, env = "PARLEY_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Synthesize text through the reply pipeline and save it as WAV
    TestTts {
        /// Text to speak
        #[arg(default_value = "你好！这是一段语音合成测试。")]
        text: String,
        /// Output file
        #[arg(short, long, default_value = "tts_test.wav")]
        output: PathBuf,
    },
    /// Stream a 16 kHz mono WAV file through recognition
    TestAsr {
        /// Input file
        wav: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,parley_gateway=info",
        1 => "info,parley_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestTts { text, output } => test_tts(config, &text, &output).await,
            Command::TestAsr { wav } => test_asr(config, &wav).await,
        };
    }

    let port = cli.port.unwrap_or(config.server.port);
    let static_dir = cli.static_dir.or_else(|| config.server.static_dir.clone());

    let services = TurnServices {
        recognizer: Arc::new(AsrClient::new(Arc::clone(&config)).context("ASR client")?),
        synthesizer: Arc::new(TtsClient::new(Arc::clone(&config)).context("TTS client")?),
        replies: Arc::new(
            ChatCompletionsSource::new(Arc::clone(&config)).context("reply source")?,
        ),
        segmenter: config.segmenter,
        max_chunk_bytes: config.asr.max_chunk_bytes,
    };

    tracing::info!(
        port,
        model = %config.llm.model,
        voice = %config.speech.tts_voice,
        "starting parley gateway"
    );

    ApiServer::new(services, config.server.greeting.clone(), port)
        .static_dir(static_dir)
        .run()
        .await?;
    Ok(())
}

/// Collects reply audio in memory
#[derive(Default)]
struct BufferSink {
    pcm: Mutex<Vec<u8>>,
    first_chunk: Mutex<Option<Instant>>,
}

#[async_trait]
impl AudioSink for BufferSink {
    async fn send_audio(&self, chunk: Bytes) -> parley_gateway::Result<()> {
        if let Ok(mut first) = self.first_chunk.lock() {
            first.get_or_insert_with(Instant::now);
        }
        if let Ok(mut pcm) = self.pcm.lock() {
            pcm.extend_from_slice(&chunk);
        }
        Ok(())
    }
}

async fn test_tts(config: Arc<Config>, text: &str, output: &Path) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synthesizer = Arc::new(TtsClient::new(Arc::clone(&config))?);
    let sink = Arc::new(BufferSink::default());

    let started = Instant::now();
    let mut speaker = ReplySpeaker::start(config.segmenter, synthesizer, sink.clone());
    // Feed character by character, the way a streamed reply arrives
    for ch in text.chars() {
        speaker.feed(ch.encode_utf8(&mut [0; 4]));
    }
    let report = speaker.drain().await;

    let pcm = sink.pcm.lock().map(|p| p.clone()).unwrap_or_default();
    let first_audio = sink
        .first_chunk
        .lock()
        .ok()
        .and_then(|f| *f)
        .map(|t| t.duration_since(started));

    println!(
        "Segments: {}, chunks: {}, bytes: {}",
        report.segments, report.chunks, report.bytes
    );
    if let Some(latency) = first_audio {
        println!("First audio after {} ms", latency.as_millis());
    }
    anyhow::ensure!(!pcm.is_empty(), "no audio received");

    write_wav(output, &pcm, config.tts.sample_rate)?;
    println!("Wrote {}", output.display());
    Ok(())
}

async fn test_asr(config: Arc<Config>, wav: &Path) -> anyhow::Result<()> {
    let (pcm, rate) = read_wav(wav)?;
    anyhow::ensure!(
        rate == config.asr.sample_rate,
        "{} is {rate} Hz, recognition expects {} Hz",
        wav.display(),
        config.asr.sample_rate
    );

    let recognizer = AsrClient::new(Arc::clone(&config))?;
    let (tx, rx) = mpsc::channel::<Bytes>(8);

    // 100 ms of 16-bit mono audio per chunk, paced in real time
    let chunk_bytes = (rate as usize / 10) * 2;
    let feeder = tokio::spawn(async move {
        for chunk in pcm.chunks(chunk_bytes) {
            if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let started = Instant::now();
    let mut updates = recognizer.recognize(ReceiverStream::new(rx).boxed(), CancellationToken::new());
    let mut last = String::new();
    while let Some(text) = updates.next().await {
        println!("  … {text}");
        last = text;
    }
    let _ = feeder.await;

    println!(
        "\nFinal ({} ms): {}",
        started.elapsed().as_millis(),
        if last.is_empty() { "<empty>" } else { &last }
    );
    Ok(())
}
