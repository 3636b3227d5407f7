//! Opaque argument/reply marshaling for the RPC fabric.
//!
//! The network and server host never look inside an encoded payload; they
//! pass `Vec<u8>` around and leave `encode`/`decode` to the service layer.
//! Round-tripping via MessagePack (the same wire format `kvshard-net`'s
//! ancestor used for inter-node `Msg` framing) keeps the format
//! self-describing, so no out-of-band schema needs to travel with it.

use kvshard_base::Error;
use serde::{de::DeserializeOwned, Serialize};

#[cfg(test)]
use test_log::test;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct RoundTripProbe {
    key: String,
    value: String,
    n: i64,
}

#[test]
fn round_trips_a_value() {
    let probe = RoundTripProbe {
        key: "k".into(),
        value: "v".into(),
        n: -7,
    };
    let bytes = encode(&probe).unwrap();
    let back: RoundTripProbe = decode(&bytes).unwrap();
    assert_eq!(probe, back);
}

#[test]
fn decode_of_garbage_is_an_error() {
    let garbage = vec![0xff, 0x00, 0x01];
    let result: Result<RoundTripProbe, Error> = decode(&garbage);
    assert!(result.is_err());
}
