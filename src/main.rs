use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser};

use bergamot_host::config::{init_default_config, HostConfig};
use bergamot_host::logging;
use bergamot_host::memory::{alignment_for, check_file_set};
use bergamot_host::repository::{load_inference_unit, sha256_hex, ModelRepository};
use bergamot_host::router::{plan_legs, LanguagePair};

#[derive(Parser, Debug)]
#[command(name = "bergamot-host")]
#[command(about = "Preflight check for translation models and the inference unit", long_about = None)]
struct Args {
    /// Generate the default config file, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write the config file (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite an existing config file when used with --init-config
    #[arg(long)]
    force: bool,

    /// Config file path (default: search for bergamot-host.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source language code (e.g. es)
    #[arg(long)]
    source_lang: Option<String>,

    /// Target language code (e.g. fr)
    #[arg(long)]
    target_lang: Option<String>,

    /// Models directory (overrides config)
    #[arg(long, value_name = "DIR")]
    models_dir: Option<PathBuf>,

    /// Pivot language code (overrides config)
    #[arg(long)]
    pivot: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let (source, target) = match (args.source_lang.as_deref(), args.target_lang.as_deref()) {
        (Some(s), Some(t)) => (s.to_string(), t.to_string()),
        _ => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!("\n\nUSAGE:\n  bergamot-host --source-lang es --target-lang fr\n");
            return Ok(());
        }
    };

    let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut cfg = HostConfig::resolve(args.config, &workdir).context("build config")?;
    if let Some(dir) = args.models_dir {
        cfg.models_dir = dir;
    }
    if let Some(pivot) = args.pivot {
        cfg.pivot_language = pivot;
    }
    logging::init(&cfg.log_filter);

    let binary = load_inference_unit(&cfg.inference_unit)?;
    println!(
        "inference unit {} ({} bytes, sha256 {})",
        cfg.inference_unit.display(),
        binary.len(),
        sha256_hex(&binary)
    );

    let pair = LanguagePair::new(&source, &target);
    let legs = plan_legs(&pair, &cfg.pivot_language);
    println!("{pair}: {} leg(s) via pivot {:?}", legs.len(), cfg.pivot_language);

    let repo = ModelRepository::new(&cfg.models_dir);
    for leg in &legs {
        let payload = repo.load_payload(leg)?;
        println!("  leg {leg}");
        for (file_type, blob) in payload.language_model_files.iter() {
            let alignment = alignment_for(file_type)
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".to_string());
            println!(
                "    {file_type:<13} {:>12} bytes  align {alignment:>3}  sha256 {}",
                blob.len(),
                sha256_hex(blob.as_bytes())
            );
        }
        check_file_set(&payload.language_model_files)
            .with_context(|| format!("check model files for {leg}"))?;
    }
    println!("ok");
    Ok(())
}
