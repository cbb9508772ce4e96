use clap::Parser as _;
use std::path;

#[derive(clap::Parser)]
struct Arguments {
  #[clap(flatten)]
  arguments: mailstatus::Arguments,
  #[arg(
    long = "log-directory",
    help = "Also write a trace-level log file to this directory"
  )]
  pub log_directory: Option<String>,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();

  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new(
    "{d(%F %T)} {l} {t} - {m}{n}",
  ));
  let mut config = log4rs::config::Config::builder().appender(
    log4rs::config::Appender::builder()
      .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
        arguments.verbose.log_level_filter(),
      )))
      .build(
        "console",
        Box::new(
          log4rs::append::console::ConsoleAppender::builder()
            .encoder(encoder.clone())
            .build(),
        ),
      ),
  );
  let mut root = log4rs::config::Root::builder().appender("console");
  if let Some(log_directory) = &arguments.log_directory {
    config = config.appender(
      log4rs::config::Appender::builder()
        .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
          log::LevelFilter::Trace,
        )))
        .build(
          "file",
          Box::new(
            log4rs::append::file::FileAppender::builder()
              .encoder(encoder)
              .build(path::Path::new(log_directory).join("mailstatus.log"))?,
          ),
        ),
    );
    root = root.appender("file");
  }
  log4rs::init_config(config.build(root.build(log::LevelFilter::Trace))?)?;

  mailstatus::run(&arguments.arguments)
}
