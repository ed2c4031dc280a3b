//! Client side of the ledger: typed queries, signed mutations and the
//! meeting list a front-end renders.

use std::{
    fmt,
    sync::{
        mpsc::{self, TryRecvError},
        Arc,
    },
    thread,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::contracts::{Entrypoint, Meeting, MeetingId, NewMeeting, ReturnValue, Ticket};
use crate::identity::{Call, Keypair};
use crate::ledger::{AccountId, Amount};
use crate::rpc::{ChainStatus, Request, RpcError, Transport};
use crate::runtime::Receipt;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("cannot decode {what}: {source}")]
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },
    #[error("{0} returned an unexpected value")]
    UnexpectedReturn(&'static str),
    #[error("no signing key configured")]
    NoSigner,
    #[error("invalid {field}: {value:?}")]
    Form { field: &'static str, value: String },
    #[error("unknown meeting {0}")]
    UnknownMeeting(MeetingId),
    #[error("ticket total overflows")]
    Overflow,
    #[error("call abandoned before completion")]
    Abandoned,
}

impl AdapterError {
    /// Error kind reported by the node, if the node rejected the call.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            AdapterError::Rpc(err) => err.remote_kind(),
            _ => None,
        }
    }
}

fn decode<R: DeserializeOwned>(what: &'static str, value: Value) -> Result<R, AdapterError> {
    serde_json::from_value(value).map_err(|source| AdapterError::Decode { what, source })
}

/// Completion handle for a submitted mutation.
#[must_use = "waiting on the handle is the only way to learn the outcome"]
pub struct PendingCall {
    entrypoint: &'static str,
    rx: mpsc::Receiver<Result<Receipt, AdapterError>>,
}

impl PendingCall {
    fn resolved(entrypoint: &'static str, result: Result<Receipt, AdapterError>) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(result);
        Self { entrypoint, rx }
    }

    pub fn entrypoint(&self) -> &'static str {
        self.entrypoint
    }

    /// Blocks until the node has answered.
    pub fn wait(self) -> Result<Receipt, AdapterError> {
        self.rx.recv().unwrap_or(Err(AdapterError::Abandoned))
    }

    pub fn try_wait(&self) -> Option<Result<Receipt, AdapterError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(AdapterError::Abandoned)),
        }
    }
}

pub struct MeetupClient<T> {
    transport: Arc<T>,
    contract: String,
    signer: Option<Arc<Keypair>>,
}

impl<T> Clone for MeetupClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            contract: self.contract.clone(),
            signer: self.signer.clone(),
        }
    }
}

impl<T: Transport + 'static> MeetupClient<T> {
    pub fn new(transport: T, contract: impl Into<String>) -> Self {
        Self {
            transport: Arc::new(transport),
            contract: contract.into(),
            signer: None,
        }
    }

    pub fn with_signer(mut self, keypair: Keypair) -> Self {
        self.signer = Some(Arc::new(keypair));
        self
    }

    pub fn account(&self) -> Option<AccountId> {
        self.signer.as_ref().map(|k| k.account())
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Simulated call; the node never commits it.
    pub fn call_static<R: DeserializeOwned>(&self, entrypoint: Entrypoint) -> Result<R, AdapterError> {
        let what = entrypoint.name();
        let call = Call {
            contract: self.contract.clone(),
            caller: self.account().unwrap_or_default(),
            nonce: 0,
            value: 0,
            entrypoint,
        };
        let value = self.transport.round_trip(Request::Static { call })?;
        decode(what, value)
    }

    /// Like [`call_static`](Self::call_static), but failures are logged and
    /// come back as `None`.
    pub fn query_only<R: DeserializeOwned>(&self, entrypoint: Entrypoint) -> Option<R> {
        let what = entrypoint.name();
        match self.call_static(entrypoint) {
            Ok(value) => Some(value),
            Err(err) => {
                error!(entrypoint = what, error = %err, "query failed");
                None
            }
        }
    }

    pub fn get_meeting(&self, meeting_id: MeetingId) -> Result<Meeting, AdapterError> {
        self.call_static(Entrypoint::GetMeeting { meeting_id })
    }

    pub fn get_meetings_length(&self) -> Result<u64, AdapterError> {
        self.call_static(Entrypoint::GetMeetingsLength)
    }

    pub fn get_ticket(&self, meeting_id: MeetingId, owner: &str) -> Result<Ticket, AdapterError> {
        self.call_static(Entrypoint::GetTicket {
            meeting_id,
            owner: owner.to_string(),
        })
    }

    pub fn balance(&self, account: &str) -> Result<Amount, AdapterError> {
        let value = self.transport.round_trip(Request::Balance {
            account: account.to_string(),
        })?;
        decode("balance", value)
    }

    pub fn status(&self) -> Result<ChainStatus, AdapterError> {
        decode("status", self.transport.round_trip(Request::Status)?)
    }

    /// Signs and submits a committing call on a background thread.
    ///
    /// Several calls may be outstanding at once; the node decides their
    /// commit order.
    pub fn mutate(&self, entrypoint: Entrypoint, value: Amount) -> PendingCall {
        let name = entrypoint.name();
        let Some(signer) = self.signer.clone() else {
            return PendingCall::resolved(name, Err(AdapterError::NoSigner));
        };
        let (tx, rx) = mpsc::channel();
        let transport = Arc::clone(&self.transport);
        let contract = self.contract.clone();
        thread::spawn(move || {
            let result = submit(transport.as_ref(), &signer, contract, entrypoint, value);
            match &result {
                Ok(receipt) => info!(entrypoint = name, height = receipt.height, "call confirmed"),
                Err(err) => error!(entrypoint = name, error = %err, "call failed"),
            }
            let _ = tx.send(result);
        });
        PendingCall {
            entrypoint: name,
            rx,
        }
    }
}

fn submit<T: Transport>(
    transport: &T,
    signer: &Keypair,
    contract: String,
    entrypoint: Entrypoint,
    value: Amount,
) -> Result<Receipt, AdapterError> {
    let caller = signer.account();
    let nonce: u64 = decode(
        "nonce",
        transport.round_trip(Request::Nonce {
            account: caller.clone(),
        })?,
    )?;
    let what = entrypoint.name();
    let signed = signer.sign(Call {
        contract,
        caller,
        nonce,
        value,
        entrypoint,
    });
    decode(what, transport.round_trip(Request::Commit { call: signed })?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusAction {
    Open,
    Close,
}

impl StatusAction {
    /// The action offered for a meeting in the given state.
    pub fn for_opened(opened: bool) -> Self {
        if opened {
            StatusAction::Close
        } else {
            StatusAction::Open
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusAction::Open => "Open",
            StatusAction::Close => "Close",
        }
    }
}

impl fmt::Display for StatusAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Display record for one meeting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingView {
    pub id: MeetingId,
    pub name: String,
    pub date: String,
    pub time: String,
    pub capacity: u64,
    pub ticket_price: Amount,
    pub address1: String,
    pub address2: String,
    pub image: String,
    pub opened: bool,
    pub status_action: StatusAction,
}

impl MeetingView {
    pub fn project(id: MeetingId, meeting: &Meeting) -> Self {
        Self {
            id,
            name: meeting.name.clone(),
            date: meeting.date.clone(),
            time: meeting.time.clone(),
            capacity: meeting.capacity,
            ticket_price: meeting.ticket_price,
            address1: meeting.address1.clone(),
            address2: meeting.address2.clone(),
            image: meeting.image.clone(),
            opened: meeting.opened,
            status_action: StatusAction::for_opened(meeting.opened),
        }
    }
}

/// Raw text of the create-meeting inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeetingForm {
    pub name: String,
    pub date: String,
    pub time: String,
    pub capacity: String,
    pub ticket_price: String,
    pub image: String,
    pub address1: String,
    pub address2: String,
}

impl MeetingForm {
    pub fn parse(&self) -> Result<NewMeeting, AdapterError> {
        Ok(NewMeeting {
            name: self.name.clone(),
            date: self.date.clone(),
            time: self.time.clone(),
            capacity: parse_number("capacity", &self.capacity)?,
            ticket_price: parse_number("ticket price", &self.ticket_price)?,
            image: self.image.clone(),
            address1: self.address1.clone(),
            address2: self.address2.clone(),
        })
    }
}

fn parse_number(field: &'static str, raw: &str) -> Result<u64, AdapterError> {
    raw.trim().parse().map_err(|_| AdapterError::Form {
        field,
        value: raw.to_string(),
    })
}

/// The meeting list plus the actions a page offers on it. Every action waits
/// for its call to complete before re-reading the affected meeting.
pub struct Board<T> {
    client: MeetupClient<T>,
    meetings: Vec<MeetingView>,
}

impl<T: Transport + 'static> Board<T> {
    pub fn new(client: MeetupClient<T>) -> Self {
        Self {
            client,
            meetings: Vec::new(),
        }
    }

    pub fn client(&self) -> &MeetupClient<T> {
        &self.client
    }

    pub fn meetings(&self) -> &[MeetingView] {
        &self.meetings
    }

    pub fn meeting(&self, id: MeetingId) -> Option<&MeetingView> {
        self.meetings.iter().find(|m| m.id == id)
    }

    fn position(&self, id: MeetingId) -> Result<usize, AdapterError> {
        self.meetings
            .iter()
            .position(|m| m.id == id)
            .ok_or(AdapterError::UnknownMeeting(id))
    }

    /// Re-reads every meeting in id order. When the length query fails the
    /// previous list is kept.
    pub fn load(&mut self) -> usize {
        let Some(length) = self.client.query_only::<u64>(Entrypoint::GetMeetingsLength) else {
            return self.meetings.len();
        };
        let mut meetings = Vec::new();
        for meeting_id in 0..length {
            if let Some(meeting) = self
                .client
                .query_only::<Meeting>(Entrypoint::GetMeeting { meeting_id })
            {
                meetings.push(MeetingView::project(meeting_id, &meeting));
            }
        }
        self.meetings = meetings;
        self.meetings.len()
    }

    fn refresh(&mut self, position: usize, meeting_id: MeetingId) {
        if let Some(meeting) = self
            .client
            .query_only::<Meeting>(Entrypoint::GetMeeting { meeting_id })
        {
            self.meetings[position] = MeetingView::project(meeting_id, &meeting);
        }
    }

    /// `Ok(None)` when the quantity exceeds the cached capacity and nothing
    /// was sent.
    pub fn buy(&mut self, meeting_id: MeetingId, quantity: u64) -> Result<Option<Receipt>, AdapterError> {
        let position = self.position(meeting_id)?;
        let view = &self.meetings[position];
        if quantity > view.capacity {
            info!(meeting_id, quantity, capacity = view.capacity, "purchase not sent");
            return Ok(None);
        }
        let amount = view
            .ticket_price
            .checked_mul(quantity)
            .ok_or(AdapterError::Overflow)?;

        let result = self
            .client
            .mutate(
                Entrypoint::BuyTicket {
                    meeting_id,
                    quantity,
                },
                amount,
            )
            .wait();
        self.refresh(position, meeting_id);
        result.map(Some)
    }

    /// Flips open/closed. `Ok(None)` for sold-out meetings, which are left
    /// alone.
    pub fn toggle_status(&mut self, meeting_id: MeetingId) -> Result<Option<Receipt>, AdapterError> {
        let position = self.position(meeting_id)?;
        let view = &self.meetings[position];
        if view.capacity == 0 {
            return Ok(None);
        }
        let entrypoint = match view.status_action {
            StatusAction::Close => Entrypoint::CloseMeeting { meeting_id },
            StatusAction::Open => Entrypoint::OpenMeeting { meeting_id },
        };
        let result = self.client.mutate(entrypoint, 0).wait();
        self.refresh(position, meeting_id);
        result.map(Some)
    }

    pub fn update_image(&mut self, meeting_id: MeetingId, image: &str) -> Result<Receipt, AdapterError> {
        let position = self.position(meeting_id)?;
        let result = self
            .client
            .mutate(
                Entrypoint::UpdateImage {
                    meeting_id,
                    image: image.to_string(),
                },
                0,
            )
            .wait();
        self.refresh(position, meeting_id);
        result
    }

    pub fn create_meeting(&mut self, form: &MeetingForm) -> Result<MeetingId, AdapterError> {
        let new = form.parse()?;
        let receipt = self
            .client
            .mutate(Entrypoint::CreateMeeting(new), 0)
            .wait()?;
        let ReturnValue::Int(meeting_id) = receipt.ret else {
            return Err(AdapterError::UnexpectedReturn("createMeeting"));
        };
        if let Some(meeting) = self
            .client
            .query_only::<Meeting>(Entrypoint::GetMeeting { meeting_id })
        {
            let view = MeetingView::project(meeting_id, &meeting);
            match self.position(meeting_id) {
                Ok(position) => self.meetings[position] = view,
                Err(_) => self.meetings.push(view),
            }
        }
        Ok(meeting_id)
    }
}
