//! The meetup contract: meetings keyed by sequential id, each with a
//! capacity-bounded ticket inventory.
//!
//! Every entrypoint is a pure function of the current state and the call
//! context. Mutations hand back a replacement [`MeetupState`] and never touch
//! the input, so a caller that drops the result on error has rolled back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use crate::ledger::{AccountId, Amount, Leaf};

pub type MeetingId = u64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("contract state is not initialized")]
    Uninitialized,
    #[error("contract state is already initialized")]
    AlreadyInitialized,
    #[error("meeting {meeting_id} not found")]
    NotFound { meeting_id: MeetingId },
    #[error("no ticket held by {owner} for meeting {meeting_id}")]
    TicketNotFound {
        meeting_id: MeetingId,
        owner: AccountId,
    },
    #[error("meeting {meeting_id} has ended or is closed")]
    Closed { meeting_id: MeetingId },
    #[error("attached value {attached} does not cover the total price {required}")]
    InsufficientPayment { required: Amount, attached: Amount },
    #[error("cannot buy {requested} tickets, only {available} left")]
    InsufficientCapacity { requested: u64, available: u64 },
    #[error("arithmetic overflow")]
    Overflow,
    #[error("{entrypoint} does not accept an attached value")]
    NotPayable { entrypoint: &'static str },
}

impl ContractError {
    /// Stable name used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ContractError::Uninitialized => "uninitialized",
            ContractError::AlreadyInitialized => "already_initialized",
            ContractError::NotFound { .. } => "not_found",
            ContractError::TicketNotFound { .. } => "ticket_not_found",
            ContractError::Closed { .. } => "closed",
            ContractError::InsufficientPayment { .. } => "insufficient_payment",
            ContractError::InsufficientCapacity { .. } => "insufficient_capacity",
            ContractError::Overflow => "overflow",
            ContractError::NotPayable { .. } => "not_payable",
        }
    }
}

/// One holder's cumulative purchase for one meeting.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub owner: AccountId,
    pub quantity: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    /// Receives every ticket payment.
    pub creator_address: AccountId,
    pub name: String,
    pub date: String,
    pub time: String,
    /// Tickets still available.
    pub capacity: u64,
    pub address1: String,
    pub address2: String,
    pub image: String,
    /// Unit price in base currency.
    pub ticket_price: Amount,
    pub opened: bool,
    pub tickets: BTreeMap<AccountId, Ticket>,
}

impl Meeting {
    pub fn ticket(&self, owner: &str) -> Option<&Ticket> {
        self.tickets.get(owner)
    }

    pub fn tickets_sold(&self) -> u64 {
        self.tickets.values().map(|t| t.quantity).sum()
    }

    fn leaf(&self, meeting_id: MeetingId) -> [u8; 32] {
        let mut leaf = Leaf::new(b"meeting")
            .u64(meeting_id)
            .str(&self.creator_address)
            .str(&self.name)
            .str(&self.date)
            .str(&self.time)
            .str(&self.address1)
            .str(&self.address2)
            .str(&self.image)
            .u64(self.capacity)
            .u64(self.ticket_price)
            .u64(self.opened as u64);
        for ticket in self.tickets.values() {
            leaf = leaf.str(&ticket.owner).u64(ticket.quantity);
        }
        leaf.finish()
    }
}

/// Display and pricing fields supplied by `createMeeting`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMeeting {
    pub name: String,
    pub date: String,
    pub time: String,
    pub capacity: u64,
    pub ticket_price: Amount,
    pub image: String,
    pub address1: String,
    pub address2: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MeetupState {
    pub meetings: BTreeMap<MeetingId, Meeting>,
    pub meetings_length: u64,
}

/// Who is calling and how much base currency rides along with the call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallContext {
    pub caller: AccountId,
    pub value: Amount,
}

/// A payout the runtime must make out of the contract's balance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Spend {
    pub to: AccountId,
    pub amount: Amount,
}

impl MeetupState {
    pub fn init() -> Self {
        Self::default()
    }

    pub fn get_meeting(&self, meeting_id: MeetingId) -> Result<&Meeting, ContractError> {
        self.meetings
            .get(&meeting_id)
            .ok_or(ContractError::NotFound { meeting_id })
    }

    pub fn get_meetings_length(&self) -> u64 {
        self.meetings_length
    }

    pub fn get_ticket(&self, meeting_id: MeetingId, owner: &str) -> Result<&Ticket, ContractError> {
        self.get_meeting(meeting_id)?
            .ticket(owner)
            .ok_or_else(|| ContractError::TicketNotFound {
                meeting_id,
                owner: owner.to_string(),
            })
    }

    pub fn create_meeting(
        &self,
        caller: &AccountId,
        new: NewMeeting,
    ) -> Result<(MeetupState, MeetingId), ContractError> {
        let meeting_id = self.meetings_length;
        let meeting = Meeting {
            creator_address: caller.clone(),
            name: new.name,
            date: new.date,
            time: new.time,
            capacity: new.capacity,
            address1: new.address1,
            address2: new.address2,
            image: new.image,
            ticket_price: new.ticket_price,
            opened: false,
            tickets: BTreeMap::new(),
        };
        let mut next = self.with_meeting(meeting_id, meeting);
        next.meetings_length = meeting_id.checked_add(1).ok_or(ContractError::Overflow)?;
        Ok((next, meeting_id))
    }

    /// All guards run before anything is built, so an error means nothing moved.
    pub fn buy_ticket(
        &self,
        ctx: &CallContext,
        meeting_id: MeetingId,
        quantity: u64,
    ) -> Result<(MeetupState, Spend), ContractError> {
        let meeting = self.get_meeting(meeting_id)?;
        if !meeting.opened {
            return Err(ContractError::Closed { meeting_id });
        }

        let total = meeting
            .ticket_price
            .checked_mul(quantity)
            .ok_or(ContractError::Overflow)?;
        if ctx.value < total {
            return Err(ContractError::InsufficientPayment {
                required: total,
                attached: ctx.value,
            });
        }

        if meeting.capacity < quantity {
            return Err(ContractError::InsufficientCapacity {
                requested: quantity,
                available: meeting.capacity,
            });
        }

        let owned = meeting.ticket(&ctx.caller).map_or(0, |t| t.quantity);
        let owned_after = owned.checked_add(quantity).ok_or(ContractError::Overflow)?;

        let mut updated = meeting.clone();
        updated.capacity -= quantity;
        updated.opened = updated.capacity != 0;
        updated.tickets.insert(
            ctx.caller.clone(),
            Ticket {
                owner: ctx.caller.clone(),
                quantity: owned_after,
            },
        );

        // the whole attached value goes to the creator, overpayment included
        let spend = Spend {
            to: meeting.creator_address.clone(),
            amount: ctx.value,
        };
        Ok((self.with_meeting(meeting_id, updated), spend))
    }

    pub fn update_image(&self, meeting_id: MeetingId, image: &str) -> Result<MeetupState, ContractError> {
        let mut updated = self.get_meeting(meeting_id)?.clone();
        updated.image = image.to_string();
        Ok(self.with_meeting(meeting_id, updated))
    }

    pub fn open_meeting(&self, meeting_id: MeetingId) -> Result<MeetupState, ContractError> {
        self.set_opened(meeting_id, true)
    }

    pub fn close_meeting(&self, meeting_id: MeetingId) -> Result<MeetupState, ContractError> {
        self.set_opened(meeting_id, false)
    }

    /// Overrides the derived status; capacity is not consulted.
    fn set_opened(&self, meeting_id: MeetingId, opened: bool) -> Result<MeetupState, ContractError> {
        let mut updated = self.get_meeting(meeting_id)?.clone();
        updated.opened = opened;
        Ok(self.with_meeting(meeting_id, updated))
    }

    fn with_meeting(&self, meeting_id: MeetingId, meeting: Meeting) -> MeetupState {
        let mut next = self.clone();
        next.meetings.insert(meeting_id, meeting);
        next
    }

    pub fn leaves(&self) -> Vec<[u8; 32]> {
        let mut leaves: Vec<[u8; 32]> = self
            .meetings
            .iter()
            .map(|(id, meeting)| meeting.leaf(*id))
            .collect();
        leaves.push(Leaf::new(b"length").u64(self.meetings_length).finish());
        leaves
    }
}

/// The contract's callable surface. Serialized as
/// `{"name": "<entrypoint>", "args": {...}}` with camelCase names.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "name",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Entrypoint {
    Init,
    GetMeeting {
        meeting_id: MeetingId,
    },
    GetMeetingsLength,
    GetTicket {
        meeting_id: MeetingId,
        owner: AccountId,
    },
    CreateMeeting(NewMeeting),
    BuyTicket {
        meeting_id: MeetingId,
        quantity: u64,
    },
    UpdateImage {
        meeting_id: MeetingId,
        image: String,
    },
    OpenMeeting {
        meeting_id: MeetingId,
    },
    CloseMeeting {
        meeting_id: MeetingId,
    },
}

impl Entrypoint {
    pub fn name(&self) -> &'static str {
        match self {
            Entrypoint::Init => "init",
            Entrypoint::GetMeeting { .. } => "getMeeting",
            Entrypoint::GetMeetingsLength => "getMeetingsLength",
            Entrypoint::GetTicket { .. } => "getTicket",
            Entrypoint::CreateMeeting(_) => "createMeeting",
            Entrypoint::BuyTicket { .. } => "buyTicket",
            Entrypoint::UpdateImage { .. } => "updateImage",
            Entrypoint::OpenMeeting { .. } => "openMeeting",
            Entrypoint::CloseMeeting { .. } => "closeMeeting",
        }
    }

    pub fn is_payable(&self) -> bool {
        matches!(self, Entrypoint::BuyTicket { .. })
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Entrypoint::GetMeeting { .. } | Entrypoint::GetMeetingsLength | Entrypoint::GetTicket { .. }
        )
    }

    /// Canonical byte encoding, signed over by callers.
    pub fn commitment(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str(&mut buf, self.name());
        match self {
            Entrypoint::Init | Entrypoint::GetMeetingsLength => {}
            Entrypoint::GetMeeting { meeting_id }
            | Entrypoint::OpenMeeting { meeting_id }
            | Entrypoint::CloseMeeting { meeting_id } => {
                buf.extend_from_slice(&meeting_id.to_le_bytes());
            }
            Entrypoint::GetTicket { meeting_id, owner } => {
                buf.extend_from_slice(&meeting_id.to_le_bytes());
                put_str(&mut buf, owner);
            }
            Entrypoint::CreateMeeting(new) => {
                put_str(&mut buf, &new.name);
                put_str(&mut buf, &new.date);
                put_str(&mut buf, &new.time);
                buf.extend_from_slice(&new.capacity.to_le_bytes());
                buf.extend_from_slice(&new.ticket_price.to_le_bytes());
                put_str(&mut buf, &new.image);
                put_str(&mut buf, &new.address1);
                put_str(&mut buf, &new.address2);
            }
            Entrypoint::BuyTicket {
                meeting_id,
                quantity,
            } => {
                buf.extend_from_slice(&meeting_id.to_le_bytes());
                buf.extend_from_slice(&quantity.to_le_bytes());
            }
            Entrypoint::UpdateImage { meeting_id, image } => {
                buf.extend_from_slice(&meeting_id.to_le_bytes());
                put_str(&mut buf, image);
            }
        }
        buf
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Decoded result of an entrypoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ReturnValue {
    Unit,
    Int(u64),
    State(MeetupState),
    Meeting(Box<Meeting>),
    Ticket(Ticket),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    /// Replacement state; `None` when the entrypoint only reads.
    pub state: Option<MeetupState>,
    pub ret: ReturnValue,
    pub spends: Vec<Spend>,
}

impl Execution {
    fn read(ret: ReturnValue) -> Self {
        Self {
            state: None,
            ret,
            spends: Vec::new(),
        }
    }

    fn write(state: MeetupState, ret: ReturnValue) -> Self {
        Self {
            state: Some(state),
            ret,
            spends: Vec::new(),
        }
    }
}

/// Dispatches one call. `state` is `None` until `init` has run.
pub fn execute(
    state: Option<&MeetupState>,
    ctx: &CallContext,
    entrypoint: &Entrypoint,
) -> Result<Execution, ContractError> {
    if ctx.value > 0 && !entrypoint.is_payable() {
        return Err(ContractError::NotPayable {
            entrypoint: entrypoint.name(),
        });
    }

    if let (Entrypoint::Init, None) = (entrypoint, state) {
        let fresh = MeetupState::init();
        return Ok(Execution::write(fresh.clone(), ReturnValue::State(fresh)));
    }
    let state = state.ok_or(ContractError::Uninitialized)?;

    match entrypoint {
        Entrypoint::Init => Err(ContractError::AlreadyInitialized),
        Entrypoint::GetMeeting { meeting_id } => Ok(Execution::read(ReturnValue::Meeting(
            Box::new(state.get_meeting(*meeting_id)?.clone()),
        ))),
        Entrypoint::GetMeetingsLength => {
            Ok(Execution::read(ReturnValue::Int(state.get_meetings_length())))
        }
        Entrypoint::GetTicket { meeting_id, owner } => Ok(Execution::read(ReturnValue::Ticket(
            state.get_ticket(*meeting_id, owner)?.clone(),
        ))),
        Entrypoint::CreateMeeting(new) => {
            let (next, meeting_id) = state.create_meeting(&ctx.caller, new.clone())?;
            Ok(Execution::write(next, ReturnValue::Int(meeting_id)))
        }
        Entrypoint::BuyTicket {
            meeting_id,
            quantity,
        } => {
            let (next, spend) = state.buy_ticket(ctx, *meeting_id, *quantity)?;
            Ok(Execution {
                state: Some(next),
                ret: ReturnValue::Unit,
                spends: vec![spend],
            })
        }
        Entrypoint::UpdateImage { meeting_id, image } => Ok(Execution::write(
            state.update_image(*meeting_id, image)?,
            ReturnValue::Unit,
        )),
        Entrypoint::OpenMeeting { meeting_id } => Ok(Execution::write(
            state.open_meeting(*meeting_id)?,
            ReturnValue::Unit,
        )),
        Entrypoint::CloseMeeting { meeting_id } => Ok(Execution::write(
            state.close_meeting(*meeting_id)?,
            ReturnValue::Unit,
        )),
    }
}
