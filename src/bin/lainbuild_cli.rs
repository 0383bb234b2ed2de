//! Lain Build CLI
//!
//! Commands: validate, compile, plan, render-resource, build
//! Outputs JSON to stdout, logs to stderr
//! Returns 1 on usage or IO failure, 2 on manifest or build failure

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lainbuild_core::manifest::resource::{compile_resource_instance, render_resource_instance};
use lainbuild_core::{
    BuildPipeline, BuildPlan, ClusterConfig, DockerCli, DockerfileRenderer, GitVersion, ManifestCompiler,
    SchemaValidator, SharedPrepareCache, StructuralValidator, VersionSource,
};

const EXIT_USAGE: u8 = 1;
const EXIT_FAILED: u8 = 2;

#[derive(Parser)]
#[command(name = "lainbuild-cli")]
#[command(about = "Lain Build CLI - manifest compiler and image builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config files merged in order (default: the standard lain locations)
    #[arg(short, long, global = true)]
    config: Vec<PathBuf>,

    /// Private docker registry, overriding the config files
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Treat malformed entrypoint/cmd values as empty commands
    #[arg(long, global = true)]
    lenient_commands: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the structural validator only
    Validate {
        #[arg(short, long, default_value = "lain.yaml")]
        manifest: PathBuf,
    },

    /// Validate and compile a manifest
    Compile {
        #[arg(short, long, default_value = "lain.yaml")]
        manifest: PathBuf,

        /// Defaults to the git version of the manifest's directory
        #[arg(long)]
        meta_version: Option<String>,

        /// Image for processes that declare none
        #[arg(long)]
        default_image: Option<String>,
    },

    /// Print the image name of every planned phase
    Plan {
        #[arg(short, long, default_value = "lain.yaml")]
        manifest: PathBuf,

        #[arg(long)]
        meta_version: Option<String>,

        #[arg(long)]
        ignore_prepare: bool,
    },

    /// Render a resource template for a client app
    RenderResource {
        /// Resource manifest template
        #[arg(short, long)]
        template: PathBuf,

        #[arg(long)]
        resource: String,

        #[arg(long)]
        resource_version: String,

        /// Client appname
        #[arg(long)]
        client: String,

        /// Template variables as a JSON object
        #[arg(long, default_value = "{}")]
        context: String,

        /// Print the compiled instance instead of its yaml
        #[arg(long)]
        compile: bool,
    },

    /// Build images
    Build {
        #[arg(short, long, default_value = "lain.yaml")]
        manifest: PathBuf,

        #[arg(long)]
        meta_version: Option<String>,

        #[arg(long)]
        ignore_prepare: bool,

        #[arg(long, value_enum, default_value_t = Target::All)]
        phase: Target,

        /// Directory with build/release/meta.dockerfile overrides
        #[arg(long)]
        templates_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    All,
    Prepare,
    UpdatePrepare,
    Build,
    Release,
    Test,
    Meta,
}

struct Failure {
    code: u8,
    message: String,
}

impl Failure {
    fn usage(e: impl Display) -> Self {
        Self {
            code: EXIT_USAGE,
            message: e.to_string(),
        }
    }

    fn failed(e: impl Display) -> Self {
        Self {
            code: EXIT_FAILED,
            message: e.to_string(),
        }
    }
}

/// JSON body and exit code of a finished command.
struct Report {
    body: serde_json::Value,
    code: u8,
}

impl Report {
    fn ok(body: serde_json::Value) -> Self {
        Self { body, code: 0 }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli);

    let (body, code) = match run(cli.command, config) {
        Ok(report) => (report.body, report.code),
        Err(failure) => (json!({"success": false, "error": failure.message}), failure.code),
    };
    match serde_json::to_string_pretty(&body) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("cannot serialize output: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    }
    ExitCode::from(code)
}

fn load_config(cli: &Cli) -> ClusterConfig {
    let paths = if cli.config.is_empty() {
        ClusterConfig::default_paths()
    } else {
        cli.config.clone()
    };
    let mut config = ClusterConfig::load(&paths);
    if let Some(registry) = &cli.registry {
        config = config.with_registry(registry.clone());
    }
    config.lenient_commands |= cli.lenient_commands;
    config
}

fn read_manifest(path: &Path) -> Result<String, Failure> {
    fs::read_to_string(path).map_err(|e| Failure::usage(format!("cannot read {}: {}", path.display(), e)))
}

/// Build context: the directory holding the manifest.
fn context_dir(manifest: &Path) -> PathBuf {
    match manifest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn meta_version(explicit: Option<String>, manifest: &Path) -> Option<String> {
    explicit.or_else(|| GitVersion.resolve(&context_dir(manifest), ""))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, Failure> {
    serde_json::to_value(value).map_err(Failure::usage)
}

fn run(command: Commands, config: ClusterConfig) -> Result<Report, Failure> {
    match command {
        Commands::Validate { manifest } => {
            let document: serde_yaml::Value =
                serde_yaml::from_str(&read_manifest(&manifest)?).map_err(Failure::failed)?;
            let result = SchemaValidator::new().validate(&document);
            Ok(Report {
                code: if result.valid { 0 } else { EXIT_FAILED },
                body: to_json(&result)?,
            })
        }

        Commands::Compile {
            manifest,
            meta_version: version,
            default_image,
        } => {
            let text = read_manifest(&manifest)?;
            let version = meta_version(version, &manifest);
            let app = ManifestCompiler::new(config)
                .compile(&text, version.as_deref(), default_image.as_deref())
                .map_err(Failure::failed)?;
            Ok(Report::ok(json!({
                "success": true,
                "manifest_hash": app.digest().map_err(Failure::usage)?,
                "manifest": app,
            })))
        }

        Commands::Plan {
            manifest,
            meta_version: version,
            ignore_prepare,
        } => {
            let text = read_manifest(&manifest)?;
            let version = meta_version(version, &manifest);
            let compiler = ManifestCompiler::new(config);
            let app = compiler
                .compile(&text, version.as_deref(), None)
                .map_err(Failure::failed)?;
            let plan = BuildPlan::new(&app, compiler.config(), ignore_prepare);
            Ok(Report::ok(json!({"success": true, "plan": plan})))
        }

        Commands::RenderResource {
            template,
            resource,
            resource_version,
            client,
            context,
            compile,
        } => {
            let text = read_manifest(&template)?;
            let context: BTreeMap<String, serde_yaml::Value> =
                serde_json::from_str(&context).map_err(|e| Failure::usage(format!("invalid context: {}", e)))?;
            let compiler = ManifestCompiler::new(config);
            if compile {
                let app = compile_resource_instance(&compiler, &resource, &resource_version, &text, &client, &context)
                    .map_err(Failure::failed)?;
                Ok(Report::ok(json!({"success": true, "manifest": app})))
            } else {
                let yaml = render_resource_instance(&compiler, &resource, &resource_version, &text, &client, &context)
                    .map_err(Failure::failed)?;
                Ok(Report::ok(json!({"success": true, "yaml": yaml})))
            }
        }

        Commands::Build {
            manifest,
            meta_version: version,
            ignore_prepare,
            phase,
            templates_dir,
        } => {
            let text = read_manifest(&manifest)?;
            let version = meta_version(version, &manifest);
            let compiler = ManifestCompiler::new(config);
            let app = compiler
                .compile(&text, version.as_deref(), None)
                .map_err(Failure::failed)?;
            let plan = BuildPlan::new(&app, compiler.config(), ignore_prepare);

            let client = DockerCli::new();
            let resolver = SharedPrepareCache::new(&client, compiler.config()).map_err(Failure::usage)?;
            let renderer = match templates_dir {
                Some(dir) => DockerfileRenderer::load_from_dir(&dir).map_err(Failure::usage)?,
                None => DockerfileRenderer::new(),
            };
            info!("building {} from {}", app.appname, manifest.display());
            let mut pipeline = BuildPipeline::new(&app, plan, context_dir(&manifest), &client, resolver, renderer);

            if phase == Target::All {
                let report = pipeline.run_all().map_err(Failure::failed)?;
                return Ok(Report {
                    code: if report.succeeded() { 0 } else { EXIT_FAILED },
                    body: to_json(&report)?,
                });
            }

            let outcome = match phase {
                Target::Prepare => pipeline.build_prepare(),
                Target::UpdatePrepare => pipeline.update_prepare(),
                Target::Build => pipeline.build_build(),
                Target::Release => pipeline.build_release(),
                Target::Test => pipeline.build_test(),
                Target::Meta | Target::All => pipeline.build_meta(),
            }
            .map_err(Failure::failed)?;
            Ok(Report {
                code: if outcome.is_built() { 0 } else { EXIT_FAILED },
                body: json!({
                    "success": outcome.is_built(),
                    "outcome": outcome,
                    "images": pipeline.built(),
                }),
            })
        }
    }
}
