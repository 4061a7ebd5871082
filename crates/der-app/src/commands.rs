use std::fmt::Write;

use tracing::warn;

use bus_client::BusTransport;
use device_publisher::DevicePublisher;
use discovery::{PublisherState, SubscriptionManager};
use resource_controller::ResourceController;
use types::{PublisherId, ResourceState, SignalSample};

pub const HELP: &str = "
\t[Help Menu]

> q            quit
> h            display help menu
> i <watts>    import power
> e <watts>    export power
> p            print properties
> s            print price signals
";

/// Operator input, keyed on the first character of the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Help,
    Import(String),
    Export(String),
    Properties,
    Signals,
    Unknown(String),
}

/// Returns `None` for a blank line.
pub fn parse_command(line: &str) -> Option<Command> {
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    let argument = tokens.next().unwrap_or_default().to_string();

    let command = match first.chars().next()? {
        'q' => Command::Quit,
        'h' => Command::Help,
        'i' => Command::Import(argument),
        'e' => Command::Export(argument),
        'p' => Command::Properties,
        's' => Command::Signals,
        _ => Command::Unknown(first.to_string()),
    };
    Some(command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub flow: Flow,
    pub output: String,
}

/// Runs one command against the core, then pushes the device properties to observers.
pub async fn execute<T: BusTransport>(
    command: Command,
    controller: &ResourceController,
    publisher: &DevicePublisher<T>,
    manager: &SubscriptionManager<T>,
) -> Outcome {
    let output = match command {
        Command::Quit => {
            return Outcome {
                flow: Flow::Quit,
                output: String::new(),
            }
        }
        Command::Help | Command::Unknown(_) => HELP.to_string(),
        Command::Import(argument) => match controller.set_import_watts_str(&argument) {
            Ok(watts) => format!("import power set to {watts} W"),
            Err(err) => rejected(&err),
        },
        Command::Export(argument) => match controller.set_export_watts_str(&argument) {
            Ok(watts) => format!("export power set to {watts} W"),
            Err(err) => rejected(&err),
        },
        Command::Properties => render_properties(&controller.snapshot()),
        Command::Signals => {
            let rows: Vec<_> = manager
                .publishers()
                .into_iter()
                .map(|(id, state)| {
                    let sample = manager.signal(&id);
                    (id, state, sample)
                })
                .collect();
            render_signals(&rows)
        }
    };

    if let Err(err) = publisher.push().await {
        warn!(error = %err, "property push failed");
    }

    Outcome {
        flow: Flow::Continue,
        output,
    }
}

fn rejected(err: &resource_controller::ControlError) -> String {
    warn!(error = %err, "setpoint rejected");
    metrics::counter!("der_setpoints_rejected_total").increment(1);
    "[ERROR]: Invalid Argument.".to_string()
}

pub fn render_properties(state: &ResourceState) -> String {
    let mut out = String::from("\n\t[Properties]\n\n");
    let _ = writeln!(out, "Export Energy:\t{:.4}", state.export_energy_wh);
    let _ = writeln!(out, "Export Power:\t{}", state.export_watts);
    let _ = writeln!(out, "Import Energy:\t{:.4}", state.import_energy_wh);
    let _ = writeln!(out, "Import Power:\t{}", state.import_watts);
    out
}

pub fn render_signals(rows: &[(PublisherId, PublisherState, Option<SignalSample>)]) -> String {
    let mut out = String::from("\n\t[Signals]\n\n");
    if rows.is_empty() {
        out.push_str("no publishers discovered\n");
        return out;
    }
    for (id, state, sample) in rows {
        let sample = sample.unwrap_or_default();
        let _ = writeln!(
            out,
            "{id}\t{state:?}\ttime={}\tprice={}",
            sample.time, sample.price
        );
    }
    out
}
