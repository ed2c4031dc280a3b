use std::{error::Error, path::Path, process, time::Duration};

use clap::{Parser, Subcommand};

use meetup_ledger::{
    adapter::{Board, MeetingForm, MeetingView, MeetupClient},
    config::{self, ClientConfig},
    contracts::{Entrypoint, MeetingId},
    identity::{KeyFile, Keypair},
    logging,
    rpc::TcpTransport,
    runtime::Receipt,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "meetup", version, about = "Client for the meetup ticket ledger")]
struct Cli {
    /// Node address
    #[arg(long, global = true, default_value = config::DEFAULT_NODE_ADDR)]
    node: String,

    /// Contract address
    #[arg(long, global = true, default_value = config::DEFAULT_CONTRACT)]
    contract: String,

    /// Key file holding the signing key
    #[arg(long, global = true, default_value = config::DEFAULT_KEY_FILE)]
    key: std::path::PathBuf,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true, default_value_t = config::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a keypair into the key file
    Keygen {
        #[arg(long)]
        force: bool,
    },
    /// Print the account of the key file
    Whoami,
    /// Chain height, state root and contract status
    Status,
    /// Run the contract's init entrypoint
    Init,
    /// List all meetings
    List,
    /// Show one meeting
    Show { id: MeetingId },
    /// Create a meeting
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        date: String,
        #[arg(long)]
        time: String,
        #[arg(long)]
        capacity: String,
        #[arg(long = "price")]
        ticket_price: String,
        #[arg(long, default_value = "")]
        image: String,
        #[arg(long, default_value = "")]
        address1: String,
        #[arg(long, default_value = "")]
        address2: String,
    },
    /// Buy tickets, paying price x quantity
    Buy { id: MeetingId, quantity: u64 },
    /// Open a closed meeting or close an open one
    Toggle { id: MeetingId },
    /// Force a meeting open
    Open { id: MeetingId },
    /// Force a meeting closed
    Close { id: MeetingId },
    /// Replace a meeting's image
    UpdateImage { id: MeetingId, image: String },
    /// Base-currency balance (defaults to the key file account)
    Balance { account: Option<String> },
    /// Tickets held for a meeting (defaults to the key file account)
    Ticket {
        id: MeetingId,
        owner: Option<String>,
    },
}

//==================== helpers ====================//

fn client_config(cli: &Cli) -> ClientConfig {
    ClientConfig {
        node: cli.node.clone(),
        contract: cli.contract.clone(),
        key_path: cli.key.clone(),
        timeout: Duration::from_millis(cli.timeout_ms),
    }
}

fn load_key(path: &Path) -> Result<Keypair, Box<dyn Error>> {
    if !path.exists() {
        return Err(format!(
            "no key file at {} (create one with `meetup keygen`)",
            path.display()
        )
        .into());
    }
    Ok(KeyFile::load(path)?)
}

/// Connects to the node; the signer is attached when the key file exists,
/// and required when `signed` is set.
fn connect(config: &ClientConfig, signed: bool) -> Result<MeetupClient<TcpTransport>, Box<dyn Error>> {
    let transport = TcpTransport::new(config.node.clone(), config.timeout);
    let client = MeetupClient::new(transport, config.contract.clone());
    if signed || config.key_path.exists() {
        return Ok(client.with_signer(load_key(&config.key_path)?));
    }
    Ok(client)
}

fn own_account(client: &MeetupClient<TcpTransport>, given: Option<String>) -> Result<String, Box<dyn Error>> {
    given
        .or_else(|| client.account())
        .ok_or_else(|| "no account given and no key file found".into())
}

fn print_meeting(view: &MeetingView) {
    println!("#{}  {}  ({} {})", view.id, view.name, view.date, view.time);
    if !view.address2.is_empty() {
        println!("    {}, {}", view.address1, view.address2);
    } else if !view.address1.is_empty() {
        println!("    {}", view.address1);
    }
    println!(
        "    left: {}  price: {}  status: {}  [{}]",
        view.capacity,
        view.ticket_price,
        if view.opened { "open" } else { "closed" },
        view.status_action
    );
    if !view.image.is_empty() {
        println!("    image: {}", view.image);
    }
}

fn print_receipt(receipt: &Receipt) {
    let short = receipt.call.get(..16).unwrap_or(&receipt.call);
    println!("committed at height {} (call {short})", receipt.height);
}

fn loaded_board(config: &ClientConfig, signed: bool) -> Result<Board<TcpTransport>, Box<dyn Error>> {
    let mut board = Board::new(connect(config, signed)?);
    board.load();
    Ok(board)
}

//==================== commands ====================//

fn keygen_cmd(config: &ClientConfig, force: bool) -> CliResult {
    if config.key_path.exists() && !force {
        return Err(format!(
            "{} already exists (pass --force to overwrite)",
            config.key_path.display()
        )
        .into());
    }
    let keypair = Keypair::generate();
    KeyFile::from_keypair(&keypair).save(&config.key_path)?;
    println!("account {}", keypair.account());
    println!("key written -> {}", config.key_path.display());
    Ok(())
}

fn list_cmd(config: &ClientConfig) -> CliResult {
    let board = loaded_board(config, false)?;
    if board.meetings().is_empty() {
        println!("no meetings");
    }
    for view in board.meetings() {
        print_meeting(view);
    }
    Ok(())
}

fn show_cmd(config: &ClientConfig, id: MeetingId) -> CliResult {
    let client = connect(config, false)?;
    let meeting = client.get_meeting(id)?;
    print_meeting(&MeetingView::project(id, &meeting));
    println!("    creator: {}", meeting.creator_address);
    for ticket in meeting.tickets.values() {
        println!("    holder {}: {}", ticket.owner, ticket.quantity);
    }
    Ok(())
}

fn buy_cmd(config: &ClientConfig, id: MeetingId, quantity: u64) -> CliResult {
    let mut board = loaded_board(config, true)?;
    match board.buy(id, quantity)? {
        Some(receipt) => print_receipt(&receipt),
        None => {
            let left = board.meeting(id).map_or(0, |m| m.capacity);
            println!("not sent: only {left} tickets left");
        }
    }
    if let Some(view) = board.meeting(id) {
        print_meeting(view);
    }
    Ok(())
}

fn toggle_cmd(config: &ClientConfig, id: MeetingId) -> CliResult {
    let mut board = loaded_board(config, true)?;
    match board.toggle_status(id)? {
        Some(receipt) => print_receipt(&receipt),
        None => println!("not sent: meeting #{id} is sold out"),
    }
    if let Some(view) = board.meeting(id) {
        print_meeting(view);
    }
    Ok(())
}

fn mutate_cmd(config: &ClientConfig, entrypoint: Entrypoint) -> CliResult {
    let client = connect(config, true)?;
    let receipt = client.mutate(entrypoint, 0).wait()?;
    print_receipt(&receipt);
    Ok(())
}

fn run(cli: Cli) -> CliResult {
    let config = client_config(&cli);
    match cli.command {
        Command::Keygen { force } => keygen_cmd(&config, force),
        Command::Whoami => {
            println!("{}", load_key(&config.key_path)?.account());
            Ok(())
        }
        Command::Status => {
            let status = connect(&config, false)?.status()?;
            println!("contract:    {}", status.contract_address);
            println!("initialized: {}", status.initialized);
            println!("height:      {}", status.height);
            println!("timestamp:   {}", status.timestamp);
            println!("state root:  {}", status.state_root);
            Ok(())
        }
        Command::Init => mutate_cmd(&config, Entrypoint::Init),
        Command::List => list_cmd(&config),
        Command::Show { id } => show_cmd(&config, id),
        Command::Create {
            name,
            date,
            time,
            capacity,
            ticket_price,
            image,
            address1,
            address2,
        } => {
            let form = MeetingForm {
                name,
                date,
                time,
                capacity,
                ticket_price,
                image,
                address1,
                address2,
            };
            let mut board = Board::new(connect(&config, true)?);
            let id = board.create_meeting(&form)?;
            println!("created meeting #{id}");
            if let Some(view) = board.meeting(id) {
                print_meeting(view);
            }
            Ok(())
        }
        Command::Buy { id, quantity } => buy_cmd(&config, id, quantity),
        Command::Toggle { id } => toggle_cmd(&config, id),
        Command::Open { id } => mutate_cmd(&config, Entrypoint::OpenMeeting { meeting_id: id }),
        Command::Close { id } => mutate_cmd(&config, Entrypoint::CloseMeeting { meeting_id: id }),
        Command::UpdateImage { id, image } => mutate_cmd(
            &config,
            Entrypoint::UpdateImage {
                meeting_id: id,
                image,
            },
        ),
        Command::Balance { account } => {
            let client = connect(&config, false)?;
            let account = own_account(&client, account)?;
            println!("{}", client.balance(&account)?);
            Ok(())
        }
        Command::Ticket { id, owner } => {
            let client = connect(&config, false)?;
            let owner = own_account(&client, owner)?;
            let ticket = client.get_ticket(id, &owner)?;
            println!("{} holds {} ticket(s) for meeting #{id}", ticket.owner, ticket.quantity);
            Ok(())
        }
    }
}

//==================== main ====================//

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log);
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        process::exit(2);
    }
}
