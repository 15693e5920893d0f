use super::client::Client;
use json::JsonValue;

/// Container for translating caller-supplied values into the
/// `Vec<JsonValue>` an API call sends as its parameter list.
///
/// A `Vec`/`&Vec` value is treated as a list of individual call
/// parameters. To pass a single parameter that is itself a list, wrap it
/// in a `JsonValue::Array` or a nested `vec![vec![1, 2, 3]]`.
pub struct ApiParams {
    params: Vec<JsonValue>,
}

impl ApiParams {
    pub fn serialize(&self, client: &Client) -> Option<Vec<JsonValue>> {
        let singleton = client.singleton().borrow();
        let serializer = singleton.serializer().as_ref()?;
        Some(self.params.iter().map(|v| serializer.pack(v)).collect())
    }

    pub fn deserialize(&self, client: &Client) -> Option<Vec<JsonValue>> {
        let singleton = client.singleton().borrow();
        let serializer = singleton.serializer().as_ref()?;
        Some(self.params.iter().map(|v| serializer.unpack(v)).collect())
    }

    pub fn params(&self) -> &Vec<JsonValue> {
        &self.params
    }
}

/// Implements `From<$owned>` and `From<&$owned>` for a list-like type by
/// mapping each element through `json::from`. Collapses the ~20
/// near-identical `impl From<T> for ApiParams` blocks a straight port of
/// this conversion layer would otherwise repeat by hand.
macro_rules! impl_from_list {
    ($owned:ty, $elem:ty) => {
        impl From<&$owned> for ApiParams {
            fn from(v: &$owned) -> ApiParams {
                ApiParams {
                    params: v.iter().map(|e| json::from((*e).clone())).collect(),
                }
            }
        }

        impl From<$owned> for ApiParams {
            fn from(v: $owned) -> ApiParams {
                ApiParams::from(&v)
            }
        }
    };
}

/// Implements `From<$scalar>` for a plain scalar by routing it through a
/// single-element `JsonValue`.
macro_rules! impl_from_scalar {
    ($($scalar:ty),* $(,)?) => {
        $(
            impl From<$scalar> for ApiParams {
                fn from(v: $scalar) -> ApiParams {
                    ApiParams::from(json::from(v))
                }
            }
        )*
    };
}

impl_from_list!(Vec<JsonValue>, JsonValue);
impl_from_list!(Vec<&str>, &str);
impl_from_list!(Vec<u8>, u8);
impl_from_list!(Vec<i64>, i64);
impl_from_list!(Vec<u64>, u64);
impl_from_list!(Vec<String>, String);

impl_from_scalar!(i32, i64, u32, u64, u8, i8, usize);

impl From<&str> for ApiParams {
    fn from(v: &str) -> ApiParams {
        ApiParams::from(json::from(v))
    }
}

impl From<String> for ApiParams {
    fn from(v: String) -> ApiParams {
        ApiParams::from(json::from(v))
    }
}

impl From<JsonValue> for ApiParams {
    fn from(v: JsonValue) -> ApiParams {
        ApiParams { params: vec![v] }
    }
}

impl From<&JsonValue> for ApiParams {
    fn from(v: &JsonValue) -> ApiParams {
        ApiParams::from(v.clone())
    }
}

impl From<Option<JsonValue>> for ApiParams {
    fn from(v: Option<JsonValue>) -> ApiParams {
        ApiParams {
            params: v.into_iter().collect(),
        }
    }
}

impl From<Option<&JsonValue>> for ApiParams {
    fn from(v: Option<&JsonValue>) -> ApiParams {
        ApiParams::from(v.cloned())
    }
}
