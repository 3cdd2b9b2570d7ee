use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use shared::api::{
    paths, ChatRequest, ErrorResponse, InterruptedResponse, StopResponse, TextRequest,
    TranscriptionResponse, STATUS_INTERRUPTED, UPLOAD_FIELD,
};
use shared::relay::{relay, RelayEnd, WriterSink};
use shared::{ChatMessage, DaemonStatus};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "scribe-client")]
#[command(about = "Talk to the scribe daemon")]
struct Args {
    /// Daemon base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an audio file and print its transcription
    Upload { path: PathBuf },
    /// Stop the running transcription
    Stop,
    /// Show daemon status
    Status,
    /// Stream a summary of TEXT ("-" reads stdin)
    Summary {
        text: String,
        /// Ask for the detailed summary
        #[arg(short, long)]
        detail: bool,
    },
    /// Ask a question, optionally about an uploaded recording
    Chat {
        message: Option<String>,
        /// Name of a previously uploaded file
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Print a jsMind mind map of TEXT ("-" reads stdin)
    Mindmap { text: String },
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: server.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn upload(&self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("Upload path has no file name")?;
        let form = Form::new().part(UPLOAD_FIELD, Part::bytes(bytes).file_name(file_name));

        info!("Uploading {:?}", path);
        let response = self
            .http
            .post(self.url(paths::UPLOAD))
            .multipart(form)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: TranscriptionResponse = response.json().await?;
                for segment in body.transcription {
                    println!(
                        "[{:>8.2} -> {:>8.2}] {}",
                        segment.start,
                        segment.end,
                        segment.text.trim()
                    );
                }
                Ok(())
            }
            status if status.as_u16() == STATUS_INTERRUPTED => {
                let body: InterruptedResponse = response.json().await?;
                println!(
                    "{} ({}, {} segments before stop)",
                    body.detail,
                    body.reason.as_str(),
                    body.segments
                );
                Ok(())
            }
            _ => Err(error_from(response).await),
        }
    }

    async fn stop(&self) -> Result<()> {
        let response = self.http.post(self.url(paths::STOP_TRANSCRIBE)).send().await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        let body: StopResponse = response.json().await?;
        println!("{}", body.status);
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let response = self.http.get(self.url(paths::STATUS)).send().await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        let status: DaemonStatus = response.json().await?;
        println!("transcription: {}", status.transcription_backend);
        println!("chat:          {}", status.chat_backend);
        println!("model loaded:  {}", status.model_loaded);
        println!("uptime:        {}s", status.uptime.as_secs());
        match status.current_job {
            Some(job) => println!(
                "current job:   {} {:?} ({} segments) {:?}",
                job.id, job.status, job.segments, job.source
            ),
            None => println!("current job:   none"),
        }
        Ok(())
    }

    async fn summary(&self, text: String, detail: bool) -> Result<()> {
        let path = if detail {
            paths::DETAIL_SUMMARY
        } else {
            paths::SUMMARY
        };
        let request = self.http.post(self.url(path)).json(&TextRequest { text });
        stream_to_stdout(request.send().await?).await
    }

    async fn chat(&self, message: Option<String>, file: Option<String>) -> Result<()> {
        let request = ChatRequest {
            messages: message.map(ChatMessage::user).into_iter().collect(),
            file,
        };
        let response = self
            .http
            .post(self.url(paths::CHAT))
            .json(&request)
            .send()
            .await?;
        stream_to_stdout(response).await
    }

    async fn mindmap(&self, text: String) -> Result<()> {
        let response = self
            .http
            .post(self.url(paths::MINDMAP))
            .json(&TextRequest { text })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        let document: serde_json::Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&document)?);
        Ok(())
    }
}

async fn error_from(response: Response) -> anyhow::Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.detail)
        .unwrap_or(text);
    anyhow::anyhow!("daemon returned {}: {}", status, detail)
}

/// Prints fragments as they arrive.
async fn stream_to_stdout(response: Response) -> Result<()> {
    if !response.status().is_success() {
        return Err(error_from(response).await);
    }

    let mut sink = WriterSink::new(tokio::io::stdout());
    let report = relay(response.bytes_stream(), &mut sink).await;
    let mut stdout = sink.into_inner();
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    debug!("Received {} fragments ({} bytes)", report.fragments, report.bytes);

    match report.end {
        RelayEnd::Finished => Ok(()),
        RelayEnd::UpstreamFailed(cause) => bail!("stream ended early: {}", cause),
        RelayEnd::SinkClosed => bail!("stdout closed"),
    }
}

fn text_arg(text: String) -> Result<String> {
    if text != "-" {
        return Ok(text);
    }
    let mut buffer = String::new();
    std::io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read stdin")?;
    Ok(buffer)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let client = Client::new(&args.server);

    match args.command {
        Command::Upload { path } => client.upload(&path).await,
        Command::Stop => client.stop().await,
        Command::Status => client.status().await,
        Command::Summary { text, detail } => client.summary(text_arg(text)?, detail).await,
        Command::Chat { message, file } => {
            if message.is_none() && file.is_none() {
                bail!("chat needs a message, a --file, or both");
            }
            client.chat(message, file).await
        }
        Command::Mindmap { text } => client.mindmap(text_arg(text)?).await,
    }
}
