use std::{io::Read as _, path::PathBuf, rc::Rc};
use wikitext_pipeline::{
    Env, Options, SiteConfig, Token,
    pipeline::{DataAccess, MemoryDataAccess},
    title::NS_TEMPLATE,
    tokens::html::to_html,
};

fn usage<T>(err: &'static str) -> anyhow::Result<T> {
    let exe = std::env::args().next().unwrap_or_default();
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("Usage: {exe} [options] <input.wiki | ->\n");
    println!("Options:");
    println!("    --templates DIR: Load templates from *.wiki files in DIR");
    println!("    --config FILE: Load the site configuration from JSON");
    println!("    --title TITLE: The title of the page (default: Main Page)");
    println!("    --include: Parse as a transclusion");
    println!("    --inline: Do not add paragraphs");
    println!("    --json: Print tokens as JSON instead of HTML\n");
    println!("Set RUST_LOG=debug (or trace) to see what the handlers do.");
    Err(anyhow::Error::msg(err))
}

fn read_input(path: &str) -> anyhow::Result<String> {
    if path == "-" {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        Ok(input)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        return usage("Help requested");
    }
    let templates = args.opt_value_from_str::<_, PathBuf>("--templates")?;
    let config_path = args.opt_value_from_str::<_, PathBuf>("--config")?;
    let title = args
        .opt_value_from_str("--title")?
        .unwrap_or_else(|| "Main Page".to_string());
    let options = Options {
        is_include: args.contains("--include"),
        inline_context: args.contains("--inline"),
        ..Options::default()
    };
    let json = args.contains("--json");
    let _ = args.contains("--");
    let Some(input_path) = args.opt_free_from_str::<String>()? else {
        return usage("Missing input file argument");
    };

    if !args.finish().is_empty() {
        return usage("Unknown extra arguments passed");
    }

    let config = match config_path {
        Some(path) => SiteConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => SiteConfig::default(),
    };
    let store = match templates {
        Some(dir) => {
            let store = MemoryDataAccess::from_dir(&dir, NS_TEMPLATE, &config)?;
            log::info!("Loaded {} templates from {}", store.len(), dir.display());
            store
        }
        None => MemoryDataAccess::default(),
    };
    let store: Rc<dyn DataAccess> = Rc::new(store);

    let wikitext = read_input(&input_path)?;
    let env = Env::new(Rc::new(config), store, &title)?;
    let tokens = env
        .parse(&wikitext, options)
        .await?
        .into_iter()
        .map(Token::finalize)
        .collect::<Result<Vec<_>, _>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tokens)?);
    } else {
        println!("{}", to_html(&tokens));
    }

    log::info!("{} template fetches", env.fetch_count());
    Ok(())
}
