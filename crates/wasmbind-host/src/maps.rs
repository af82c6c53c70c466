//! Key/value map host functions.
//!
//! Guests read and replace the maps of their execution context (request
//! and response headers and trailers) through the pairs wire format:
//!
//! - `env.get_map_size(map, max) -> i32`
//! - `env.get_map(map, ptr, len, max) -> i32`
//! - `env.set_map(map, ptr, len) -> i32`
//!
//! All three return -1 for an unknown map type or a malformed buffer.
//! Out-of-bounds memory access traps.

use tracing::{debug, warn};
use wasmtime::{Val, ValType};

use wasmbind_common::HostFunctionError;
use wasmbind_core::pairs::{self, PairsMap};
use wasmbind_core::{HostCall, HostFunction};

use crate::interfaces::arg_i32;

const ERROR: i32 = -1;

/// Maps a guest can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapType {
    RequestHeaders,
    RequestTrailers,
    ResponseHeaders,
    ResponseTrailers,
}

/// Guest-visible map ids.
const MAP_TYPES: [(i32, MapType); 4] = [
    (0, MapType::RequestHeaders),
    (1, MapType::RequestTrailers),
    (2, MapType::ResponseHeaders),
    (3, MapType::ResponseTrailers),
];

impl MapType {
    /// Resolve a guest map id.
    pub fn from_i32(id: i32) -> Option<Self> {
        MAP_TYPES
            .iter()
            .find(|(key, _)| *key == id)
            .map(|(_, map)| *map)
    }

    /// Key of this map in the context's store data.
    #[allow(clippy::cast_sign_loss)]
    pub fn id(self) -> u32 {
        MAP_TYPES
            .iter()
            .find(|(_, map)| *map == self)
            .map_or(0, |(key, _)| *key as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RequestHeaders => "request headers",
            Self::RequestTrailers => "request trailers",
            Self::ResponseHeaders => "response headers",
            Self::ResponseTrailers => "response trailers",
        }
    }
}

fn arg_usize(params: &[Val], index: usize) -> Result<usize, HostFunctionError> {
    let value = arg_i32(params, index)?;
    usize::try_from(value).map_err(|_| HostFunctionError::InvalidArgument {
        reason: format!("argument {index} must not be negative (got {value})"),
    })
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(ERROR)
}

/// A copy of the addressed map; missing maps read as empty.
fn snapshot(call: &HostCall<'_, '_>, map: MapType) -> PairsMap {
    call.data().map(map.id()).cloned().unwrap_or_default()
}

fn get_map_size(call: &HostCall<'_, '_>, params: &[Val]) -> Result<i32, HostFunctionError> {
    let Some(map) = MapType::from_i32(arg_i32(params, 0)?) else {
        return Ok(ERROR);
    };
    let max = arg_usize(params, 1)?;

    let size = call
        .data()
        .map(map.id())
        .map_or_else(|| pairs::size(&[], &[], max), |m| m.encoded_size(max));

    Ok(to_i32(size))
}

fn get_map(call: &mut HostCall<'_, '_>, params: &[Val]) -> Result<i32, HostFunctionError> {
    let Some(map) = MapType::from_i32(arg_i32(params, 0)?) else {
        return Ok(ERROR);
    };
    let ptr = arg_i32(params, 1)?;
    let len = arg_usize(params, 2)?;
    let max = arg_usize(params, 3)?;

    let current = snapshot(call, map);

    let needed = current.encoded_size(max);
    if needed > len {
        warn!(
            module = %call.module_name(),
            map = map.name(),
            needed,
            available = len,
            "guest buffer too small for map"
        );
        return Ok(ERROR);
    }

    // Marshal straight into the guest window; only `needed` bytes are touched
    let window = i32::try_from(needed).map_err(|_| HostFunctionError::InvalidArgument {
        reason: format!("encoded map of {needed} bytes exceeds guest address space"),
    })?;
    let truncated = match call.with_memory_mut(ptr, window, |buf| current.marshal(buf, max))? {
        Ok(truncated) => truncated,
        Err(e) => {
            warn!(module = %call.module_name(), map = map.name(), error = %e, "failed encoding map");
            return Ok(ERROR);
        }
    };

    let count = truncated.unwrap_or_else(|| current.len());
    if let Some(count) = truncated {
        debug!(module = %call.module_name(), map = map.name(), count, "map truncated");
    }

    Ok(to_i32(count))
}

fn set_map(call: &mut HostCall<'_, '_>, params: &[Val]) -> Result<i32, HostFunctionError> {
    let Some(map) = MapType::from_i32(arg_i32(params, 0)?) else {
        return Ok(ERROR);
    };

    let bytes = call.read_memory(arg_i32(params, 1)?, arg_i32(params, 2)?)?;

    match pairs::unmarshal(&bytes) {
        Ok(decoded) => {
            debug!(
                module = %call.module_name(),
                map = map.name(),
                pairs = decoded.len(),
                "map replaced"
            );
            call.data_mut().set_map(map.id(), PairsMap::from_pairs(decoded));
            Ok(0)
        }
        Err(e) => {
            warn!(module = %call.module_name(), map = map.name(), error = %e, "failed decoding map");
            Ok(ERROR)
        }
    }
}

/// The three map functions.
pub fn functions() -> [HostFunction; 3] {
    [
        HostFunction::new(
            "get_map_size",
            vec![ValType::I32; 2],
            [ValType::I32],
            |call, params, results| {
                results[0] = Val::I32(get_map_size(call, params)?);
                Ok(())
            },
        ),
        HostFunction::new(
            "get_map",
            vec![ValType::I32; 4],
            [ValType::I32],
            |call, params, results| {
                results[0] = Val::I32(get_map(call, params)?);
                Ok(())
            },
        ),
        HostFunction::new(
            "set_map",
            vec![ValType::I32; 3],
            [ValType::I32],
            |call, params, results| {
                results[0] = Val::I32(set_map(call, params)?);
                Ok(())
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_type_table() {
        for (id, map) in MAP_TYPES {
            assert_eq!(MapType::from_i32(id), Some(map));
            assert_eq!(i64::from(map.id()), i64::from(id));
        }
        assert_eq!(MapType::from_i32(4), None);
        assert_eq!(MapType::from_i32(-1), None);
    }

    #[test]
    fn test_arg_usize() {
        assert_eq!(arg_usize(&[Val::I32(7)], 0).unwrap(), 7);
        assert!(arg_usize(&[Val::I32(-7)], 0).is_err());
        assert!(arg_usize(&[], 0).is_err());
    }

    #[test]
    fn test_functions() {
        let names: Vec<_> = functions().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, ["get_map_size", "get_map", "set_map"]);
    }
}
