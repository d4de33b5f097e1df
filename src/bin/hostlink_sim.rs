use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use hostlink::bus::{Bus, BusFaultConfig, BusFaultInjector, BusKind, LoopbackBus};
use hostlink::control::RawTpDirection;
use hostlink::sim::{SimulatedSlave, SlaveHandle, SlaveProfile};
use hostlink::{BufferHandle, InterfaceType, SendRequest, Transport, TransportConfig, TransportStats};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const DEFAULT_BUS: &str = "spi";
const DEFAULT_COUNT: &str = "100";
const DEFAULT_SIZE: &str = "256";
const ECHO_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

struct Session {
    transport: Transport,
    bus: Arc<LoopbackBus>,
    slave: SlaveHandle,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("hostlink-sim")
        .version("0.1.0")
        .about("Host link layer driven against a simulated slave")
        .arg(
            Arg::with_name("bus")
                .short("b")
                .long("bus")
                .value_name("BUS")
                .help("Bus kind to simulate")
                .takes_value(true)
                .possible_values(&["sdio", "spi", "spi-hd", "uart", "usb"])
                .default_value(DEFAULT_BUS)
                .global(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TransportConfig JSON file")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("fault-rate")
                .long("fault-rate")
                .value_name("PERCENT")
                .help("Percentage of host transfers that fail on the bus")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<f32>() {
                    Ok(rate) if (0.0..=100.0).contains(&rate) => Ok(()),
                    _ => Err("Fault rate must be between 0 and 100".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity (-v debug, -vv trace)")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("echo")
                .about("Send STA frames and count the slave's echoes")
                .arg(count_arg())
                .arg(size_arg())
                .arg(
                    Arg::with_name("throttle")
                        .long("throttle")
                        .help("Have the slave assert throttle halfway through"),
                ),
        )
        .subcommand(
            SubCommand::with_name("raw-tp")
                .about("Run a host-to-slave raw throughput test")
                .arg(count_arg())
                .arg(size_arg()),
        )
        .subcommand(
            SubCommand::with_name("power-save")
                .about("Suspend and resume the slave")
                .arg(
                    Arg::with_name("no-ack")
                        .long("no-ack")
                        .help("Slave never acknowledges, exercising the timeout path"),
                ),
        )
        .subcommand(SubCommand::with_name("status").about("Set up the link and print its status"))
        .get_matches();

    // Global args land on the deepest matched subcommand.
    let active = matches.subcommand().1.unwrap_or(&matches);
    init_tracing(active.occurrences_of("verbose"));

    let format = active.value_of("format").unwrap_or("table");
    let kind = active
        .value_of("bus")
        .and_then(BusKind::from_name)
        .unwrap_or(BusKind::Spi);
    let config = load_config(active.value_of("config"))?;

    match matches.subcommand() {
        ("echo", Some(sub)) => handle_echo(sub, kind, config, format).await?,
        ("raw-tp", Some(sub)) => handle_raw_tp(sub, kind, config, format).await?,
        ("power-save", Some(sub)) => handle_power_save(sub, kind, config, format).await?,
        ("status", Some(sub)) => handle_status(sub, kind, config, format).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Exchange data with the simulated slave", "hostlink-sim echo".bright_cyan());
            println!("  {} Measure raw throughput", "hostlink-sim raw-tp".bright_cyan());
            println!("  {} Suspend and resume", "hostlink-sim power-save".bright_cyan());
        }
    }

    Ok(())
}

fn count_arg() -> Arg<'static, 'static> {
    Arg::with_name("count")
        .short("n")
        .long("count")
        .value_name("FRAMES")
        .help("Number of frames to send")
        .takes_value(true)
        .default_value(DEFAULT_COUNT)
}

fn size_arg() -> Arg<'static, 'static> {
    Arg::with_name("size")
        .short("s")
        .long("size")
        .value_name("BYTES")
        .help("Payload size of each frame")
        .takes_value(true)
        .default_value(DEFAULT_SIZE)
}

fn init_tracing(verbosity: u64) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("hostlink={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&str>) -> CliResult<TransportConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            Ok(TransportConfig::from_json(&json)?)
        }
        None => Ok(TransportConfig::default()),
    }
}

fn parse_usize(matches: &ArgMatches<'_>, name: &str) -> CliResult<usize> {
    let raw = matches.value_of(name).ok_or_else(|| format!("missing --{}", name))?;
    let value = raw.parse::<usize>().map_err(|e| format!("invalid --{}: {}", name, e))?;
    Ok(value)
}

/// Wire a loopback pair to a simulated slave and bring the host side up.
async fn start_session(
    matches: &ArgMatches<'_>,
    kind: BusKind,
    config: TransportConfig,
    profile: SlaveProfile,
) -> CliResult<Session> {
    let (bus, slave_end) = LoopbackBus::pair(kind);
    let bus = Arc::new(bus);
    if let Some(rate) = matches.value_of("fault-rate") {
        bus.set_fault_injector(Some(BusFaultInjector::new(BusFaultConfig {
            enabled: true,
            send_failure_percent: rate.parse::<f32>()?,
            ..BusFaultConfig::default()
        })));
    }
    let slave = SimulatedSlave::spawn(slave_end, profile);

    let transport = Transport::new(Arc::clone(&bus) as Arc<dyn Bus>, config);
    let started = Instant::now();
    let negotiated = transport
        .setup(|link| {
            println!(
                "{} {} link up with {} (raw-tp {})",
                "✅".green(),
                link.bus.to_string().bright_white(),
                link.chip.to_string().bright_cyan(),
                link.raw_tp
            );
        })
        .await;
    if let Err(err) = negotiated {
        eprintln!("{} Setup failed: {}", "❌".red(), err.to_string().bright_red());
        return Err(err.into());
    }
    println!("{} handshake took {:?}", "⏱".dimmed(), started.elapsed());

    Ok(Session { transport, bus, slave })
}

async fn handle_echo(
    sub: &ArgMatches<'_>,
    kind: BusKind,
    config: TransportConfig,
    format: &str,
) -> CliResult<()> {
    let count = parse_usize(sub, "count")?;
    let size = parse_usize(sub, "size")?;
    let mut profile = SlaveProfile::for_bus(kind);
    profile.echo_data = true;
    let session = start_session(sub, kind, config, profile).await?;

    let echoes = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&echoes);
    let _channel = session.transport.register_channel(
        InterfaceType::Sta,
        false,
        Arc::new(move |handle: BufferHandle| {
            counter.fetch_add(1, Ordering::Relaxed);
            handle.release();
        }),
    )?;

    let mut rejected = 0u64;
    for i in 0..count {
        if sub.is_present("throttle") && i == count / 2 {
            session.slave.set_throttle(true).await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            session.slave.set_throttle(false).await?;
        }
        let payload = vec![i as u8; size];
        if let Err(err) = session.transport.send(SendRequest::owned(InterfaceType::Sta, 0, payload)) {
            rejected += 1;
            tracing::debug!(error = %err, "send rejected");
            tokio::time::sleep(session.transport.get_config().throttle_backoff()).await;
        }
    }

    let deadline = Instant::now() + ECHO_SETTLE_TIMEOUT;
    let expected = count as u64 - rejected;
    while echoes.load(Ordering::Relaxed) < expected && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let echoed = echoes.load(Ordering::Relaxed);
    match format {
        "json" => print_json(&session.transport).await?,
        _ => {
            println!("\n{}", "📨 Echo Results".bright_blue().bold());
            println!("{} {}", "Sent:".bright_white(), count - rejected as usize);
            println!("{} {}", "Rejected:".bright_white(), rejected);
            let echoed_str = if echoed == expected {
                echoed.to_string().green()
            } else {
                echoed.to_string().yellow()
            };
            println!("{} {}", "Echoed:".bright_white(), echoed_str);
            print_stats(&session.transport.stats());
        }
    }

    finish(session).await;
    Ok(())
}

async fn handle_raw_tp(
    sub: &ArgMatches<'_>,
    kind: BusKind,
    mut config: TransportConfig,
    format: &str,
) -> CliResult<()> {
    let count = parse_usize(sub, "count")?;
    let size = parse_usize(sub, "size")?;
    if config.raw_tp_request == RawTpDirection::None {
        config.raw_tp_request = RawTpDirection::HostToSlave;
    }
    let session = start_session(sub, kind, config, SlaveProfile::for_bus(kind)).await?;

    let report = match session.transport.raw_tp_send(count, size).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("{} Raw throughput failed: {}", "❌".red(), err.to_string().bright_red());
            finish(session).await;
            return Err(err.into());
        }
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            println!("\n{}", "🚀 Raw Throughput".bright_blue().bold());
            println!("{} {}", "Frames:".bright_white(), report.frames);
            println!("{} {}", "Bytes:".bright_white(), report.bytes);
            println!("{} {}", "Rejected:".bright_white(), report.rejected);
            println!("{} {} ms", "Elapsed:".bright_white(), report.elapsed_ms);
            println!(
                "{} {}",
                "Throughput:".bright_white(),
                format!("{:.2} Mbit/s", report.throughput_mbps).bright_green()
            );
            println!("{} {}", "Slave counted:".bright_white(), session.slave.stats().raw_tp_frames);
        }
    }

    finish(session).await;
    Ok(())
}

async fn handle_power_save(
    sub: &ArgMatches<'_>,
    kind: BusKind,
    config: TransportConfig,
    format: &str,
) -> CliResult<()> {
    let mut profile = SlaveProfile::for_bus(kind);
    profile.ack_power_save = !sub.is_present("no-ack");
    let session = start_session(sub, kind, config, profile).await?;

    for (label, result) in [
        ("Suspend", session.transport.request_power_save_start().await),
        ("Resume", session.transport.request_power_save_stop().await),
    ] {
        match result {
            Ok(outcome) => println!("{} {} {:?}", "✅".green(), label.bright_white(), outcome),
            Err(err) => println!("{} {} failed: {}", "⚠️".yellow(), label.bright_white(), err.to_string().bright_red()),
        }
    }

    match format {
        "json" => print_json(&session.transport).await?,
        _ => {
            println!("{} {}", "Power state:".bright_white(), session.transport.power_save_state());
            println!("{} {}", "Ack timeouts:".bright_white(), session.transport.stats().power_save_timeouts);
        }
    }

    finish(session).await;
    Ok(())
}

async fn handle_status(sub: &ArgMatches<'_>, kind: BusKind, config: TransportConfig, format: &str) -> CliResult<()> {
    let session = start_session(sub, kind, config, SlaveProfile::for_bus(kind)).await?;

    match format {
        "json" => print_json(&session.transport).await?,
        _ => {
            let status = session.transport.status().await;
            println!("\n{}", "📊 Link Status".bright_blue().bold());
            println!("{} {}", "Handshake:".bright_white(), status.handshake);
            if let Some(link) = &status.negotiated {
                println!("{} {}", "Chip:".bright_white(), link.chip);
                if let Some(version) = link.firmware_version {
                    println!("{} {}", "Firmware:".bright_white(), version);
                }
                println!("{} {}", "Checksum:".bright_white(), link.checksum);
                println!("{} {}", "Raw-tp:".bright_white(), link.raw_tp);
            }
            println!("{} {}", "Power state:".bright_white(), status.power_save);
            println!("{} {}", "Throttled:".bright_white(), session.transport.is_throttled());
            print_stats(&status.stats);
        }
    }

    finish(session).await;
    Ok(())
}

async fn print_json(transport: &Transport) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(&transport.status().await)?);
    Ok(())
}

fn print_stats(stats: &TransportStats) {
    println!("\n{}", "📈 Counters".bright_white().bold());
    println!(
        "  TX queued {}  sent {}  errors {}  queue-full {}  throttle requeues {}",
        stats.tx_queued, stats.tx_sent, stats.tx_send_errors, stats.tx_queue_full, stats.tx_throttle_requeues
    );
    println!(
        "  RX frames {}  dispatched {}  no-channel {}  bad {}  priv {}",
        stats.rx_frames, stats.rx_dispatched, stats.rx_no_channel, stats.rx_bad_frames, stats.rx_priv
    );
    let outstanding = stats.buffers_outstanding();
    let outstanding_str = if outstanding == 0 {
        outstanding.to_string().green()
    } else {
        outstanding.to_string().yellow()
    };
    println!("  Buffers outstanding {}", outstanding_str);
}

async fn finish(session: Session) {
    session.transport.teardown().await;
    let captured = session.bus.captured(None).len();
    session.slave.stop();
    println!("{} {} frames crossed the bus", "🔌".dimmed(), captured);
}
