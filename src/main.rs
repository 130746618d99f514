use clap::{Parser, ValueEnum};
use std::{
    collections::HashMap, error::Error, io::Write, net::SocketAddr, process::ExitCode,
    time::Duration,
};

use jurichat::{
    config::{
        check_unique_names, CorpusProfile, ModelSettings, PromptLanguage, DEFAULT_CHUNK_TOKENS,
        DEFAULT_CORPUS, DEFAULT_EMBED_MODEL, DEFAULT_MODEL, DEFAULT_OLLAMA_URL,
        DEFAULT_QDRANT_URL, DEFAULT_SESSION_TTL_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_TOP_K,
    },
    models::SharedModels,
    rag::{build_engine, index_corpus},
    server::{self, AppState, EngineTable},
    ChatError, ChatSession,
};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Mode {
    /// Load, chunk and embed every corpus
    Index,
    /// Terminal chat over the first corpus
    Chat,
    /// HTTP chat server over all corpora
    Serve,
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    // chatting model
    #[arg(short, long, env = "JURICHAT_MODEL", default_value = DEFAULT_MODEL)]
    model: String,
    // embedding model
    #[arg(short, long, env = "JURICHAT_EMBED", default_value = DEFAULT_EMBED_MODEL)]
    embed: String,
    // qdrant db url
    #[arg(long, env = "JURICHAT_DB", default_value = DEFAULT_QDRANT_URL)]
    db: String,
    #[arg(short, long, env = "JURICHAT_OLLAMA", default_value = DEFAULT_OLLAMA_URL)]
    ollama: String,
    /// Document collection as NAME=DIRECTORY, repeatable
    #[arg(
        short,
        long = "corpus",
        env = "JURICHAT_CORPUS",
        value_delimiter = ',',
        default_value = DEFAULT_CORPUS
    )]
    corpora: Vec<CorpusProfile>,
    #[arg(short, long, value_enum, env = "JURICHAT_LANGUAGE", default_value = "es")]
    language: PromptLanguage,
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,
    #[arg(long, default_value_t = DEFAULT_CHUNK_TOKENS)]
    chunk_tokens: usize,
    /// Seconds to wait for each answer fragment
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
    /// Extra attempts at reaching the language model
    #[arg(long, default_value_t = 0)]
    retries: u32,
    /// Use the existing collections instead of reindexing at startup
    #[arg(long)]
    reuse_index: bool,
    #[arg(long, env = "JURICHAT_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
    /// Seconds before an untouched web session is dropped
    #[arg(long, env = "JURICHAT_SESSION_TTL", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    session_ttl: u64,
    #[arg(value_enum)]
    mode: Mode,
}

impl Cli {
    fn settings(&self) -> ModelSettings {
        ModelSettings {
            ollama_url: self.ollama.clone(),
            model: self.model.clone(),
            embed_model: self.embed.clone(),
            qdrant_url: self.db.clone(),
            top_k: self.top_k,
            chunk_tokens: self.chunk_tokens,
            request_timeout: Duration::from_secs(self.timeout),
            retries: self.retries,
            language: self.language,
        }
    }
}

async fn index(corpora: &[CorpusProfile], settings: &ModelSettings) -> Result<(), ChatError> {
    let models = SharedModels::init(settings)?;
    let mut failed = Vec::new();
    for profile in corpora {
        match index_corpus(profile, models, settings).await {
            Ok(chunks) => println!("{}: {chunks} chunks indexed", profile.name),
            Err(e) => {
                log::error!("{}: {e}", profile.name);
                failed.push(profile.name.clone());
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(ChatError::EngineBuild(format!(
            "indexing failed for {}",
            failed.join(", ")
        )))
    }
}

async fn chat(
    profile: &CorpusProfile,
    settings: &ModelSettings,
    reindex: bool,
) -> Result<(), ChatError> {
    let session = ChatSession::create();
    match build_engine(profile, settings, reindex).await {
        Ok(engine) => session.bind_engine(engine),
        Err(e) => {
            session.block(e.clone());
            return Err(e);
        }
    }
    println!(
        "Chat ready ({}). Empty line exits, /reset clears the conversation.",
        profile.name
    );

    loop {
        // Ask for user input
        println!("\n");
        print!("Query> ");
        let _ = std::io::stdout().flush();
        let mut query = String::new();
        match std::io::stdin().read_line(&mut query) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let query = query.trim();
        if query.is_empty() {
            println!("Empty query. Exiting...");
            break;
        }
        if query == "/reset" {
            session.reset();
            println!("Conversation cleared.");
            continue;
        }

        let result = session
            .submit_with(query, |progress| {
                print!("{}", progress.fragment);
                let _ = std::io::stdout().flush();
            })
            .await;
        if let Err(e) = result {
            println!("Error: {e}");
        }
    }
    Ok(())
}

async fn serve(
    corpora: &[CorpusProfile],
    settings: &ModelSettings,
    reindex: bool,
    bind: SocketAddr,
    session_ttl: Duration,
) -> Result<(), Box<dyn Error>> {
    let mut engines: EngineTable = HashMap::new();
    for profile in corpora {
        let engine = build_engine(profile, settings, reindex).await;
        if let Err(e) = &engine {
            log::error!("corpus {} unavailable: {e}", profile.name);
        }
        engines.insert(profile.name.clone(), engine);
    }
    server::serve(bind, AppState::new(engines), session_ttl).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = check_unique_names(&cli.corpora) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }
    let settings = cli.settings();
    let reindex = !cli.reuse_index;

    let result: Result<(), Box<dyn Error>> = match cli.mode {
        Mode::Index => index(&cli.corpora, &settings).await.map_err(Into::into),
        Mode::Chat => match cli.corpora.first() {
            Some(profile) => chat(profile, &settings, reindex).await.map_err(Into::into),
            None => Err("no corpus given, add --corpus NAME=DIRECTORY".into()),
        },
        Mode::Serve => {
            let session_ttl = Duration::from_secs(cli.session_ttl);
            serve(&cli.corpora, &settings, reindex, cli.bind, session_ttl).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
