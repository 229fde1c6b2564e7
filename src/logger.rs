use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Dependencies that drown out crawl logs once the root level opens
/// up: the HTTP stack traces every connection and the HTML parser
/// grumbles about real-world markup.
const CHATTY: &[(&str, log::LevelFilter)] = &[
    ("hyper", log::LevelFilter::Info),
    ("rustls", log::LevelFilter::Error),
    ("html5ever", log::LevelFilter::Error),
    ("selectors", log::LevelFilter::Error),
];

/// Console logging tuned for a crawl: workers are threads named after
/// their host, so the thread tag says who fetched what.
pub fn init_logger(is_verbose: bool) -> log4rs::Handle {
    let root_level = if is_verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let pattern = PatternEncoder::new("{d(%H:%M:%S%.3f)} {h({l})} [{T}] {m}{n}");
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(pattern))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    for (target, level) in CHATTY {
        builder = builder.logger(Logger::builder().build(*target, *level));
    }

    let config = builder
        .build(Root::builder().appender("console").build(root_level))
        .expect("could not config logger");

    log4rs::init_config(config).expect("could not start logger")
}
