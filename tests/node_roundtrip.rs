use std::{net::TcpListener, path::PathBuf, thread, time::Duration};

use meetup_ledger::{
    adapter::{AdapterError, Board, MeetingForm, MeetupClient},
    contracts::Entrypoint,
    identity::Keypair,
    rpc::{Server, TcpTransport},
    runtime::Runtime,
    store,
};

const CONTRACT: &str = "ct_roundtrip";

fn state_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("meetup-roundtrip-{}-{name}", std::process::id()))
        .join("state.json")
}

fn spawn_node(runtime: Runtime, state: Option<PathBuf>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::new(runtime, state);
    thread::spawn(move || server.serve(listener));
    addr
}

fn board(addr: &str, keypair: &Keypair) -> Board<TcpTransport> {
    let keypair = Keypair::from_secret_hex(&keypair.secret_hex()).unwrap();
    let transport = TcpTransport::new(addr, Duration::from_secs(5));
    Board::new(MeetupClient::new(transport, CONTRACT).with_signer(keypair))
}

fn meetup_form() -> MeetingForm {
    MeetingForm {
        name: "ledger meetup".into(),
        date: "2024-09-12".into(),
        time: "18:30".into(),
        capacity: "25".into(),
        ticket_price: "1".into(),
        image: "cover.png".into(),
        address1: "Harbour Rd 4".into(),
        address2: "Hall B".into(),
    }
}

#[test]
fn sell_out_over_tcp_and_restore_from_snapshot() {
    let creator = Keypair::generate();
    let buyer = Keypair::generate();
    let path = state_path("sellout");
    let runtime = Runtime::genesis(
        CONTRACT,
        &[(creator.account(), 0), (buyer.account(), 100)],
    )
    .unwrap();
    let addr = spawn_node(runtime, Some(path.clone()));

    let mut organizer = board(&addr, &creator);
    let id = organizer.create_meeting(&meetup_form()).unwrap();
    assert_eq!(id, 0);
    organizer.toggle_status(id).unwrap().unwrap();

    let mut attendee = board(&addr, &buyer);
    assert_eq!(attendee.load(), 1);
    assert!(attendee.meeting(id).unwrap().opened);
    attendee.buy(id, 25).unwrap().unwrap();

    let view = attendee.meeting(id).unwrap();
    assert_eq!(view.capacity, 0);
    assert!(!view.opened);
    assert!(attendee.buy(id, 1).unwrap().is_none());

    // forced past the board guard, the contract still refuses
    let err = attendee
        .client()
        .mutate(
            Entrypoint::BuyTicket {
                meeting_id: id,
                quantity: 1,
            },
            1,
        )
        .wait()
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some("closed"));

    let client = attendee.client();
    assert_eq!(client.balance(&buyer.account()).unwrap(), 75);
    assert_eq!(client.balance(&creator.account()).unwrap(), 25);
    assert_eq!(client.get_ticket(id, &buyer.account()).unwrap().quantity, 25);

    let status = client.status().unwrap();
    let restored = Runtime::from_snapshot(store::load(&path).unwrap().unwrap()).unwrap();
    assert_eq!(hex::encode(restored.state_root()), status.state_root);
    assert_eq!(restored.meta().height, status.height);
    assert_eq!(restored.balance(&buyer.account()), 75);
    let meeting = restored.contract_state().unwrap().get_meeting(id).unwrap();
    assert_eq!(meeting.tickets_sold(), 25);

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn underpaid_purchase_rolls_back() {
    let creator = Keypair::generate();
    let buyer = Keypair::generate();
    let runtime = Runtime::genesis(
        CONTRACT,
        &[(creator.account(), 0), (buyer.account(), 10)],
    )
    .unwrap();
    let addr = spawn_node(runtime, None);

    let mut organizer = board(&addr, &creator);
    let mut form = meetup_form();
    form.ticket_price = "4".into();
    organizer.create_meeting(&form).unwrap();
    organizer.toggle_status(0).unwrap();

    let attendee = board(&addr, &buyer);
    let client = attendee.client();
    let before = client.status().unwrap();
    let err = client
        .mutate(
            Entrypoint::BuyTicket {
                meeting_id: 0,
                quantity: 2,
            },
            7,
        )
        .wait()
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some("insufficient_payment"));

    let after = client.status().unwrap();
    assert_eq!(after.state_root, before.state_root);
    assert_eq!(after.height, before.height);
    assert_eq!(client.balance(&buyer.account()).unwrap(), 10);
    assert_eq!(client.get_meeting(0).unwrap().capacity, 25);
}

#[test]
fn unsigned_client_reads_but_cannot_write() {
    let addr = spawn_node(Runtime::genesis(CONTRACT, &[]).unwrap(), None);
    let transport = TcpTransport::new(addr, Duration::from_secs(5));
    let client = MeetupClient::new(transport, CONTRACT);

    assert_eq!(client.get_meetings_length().unwrap(), 0);
    assert!(matches!(
        client.mutate(Entrypoint::Init, 0).wait(),
        Err(AdapterError::NoSigner)
    ));
    assert_eq!(
        client.get_meeting(3).unwrap_err().remote_kind(),
        Some("not_found")
    );
}
