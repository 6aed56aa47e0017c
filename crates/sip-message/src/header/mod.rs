pub mod name;
pub mod typed;

pub use name::Name;
pub use typed::{
    AddressHeader, AuthChallenge, AuthResponse, CSeq, CallId, Expires, HostPort, MaxForwards,
    Params, Via,
};
