//! The `__c`/`__p` envelope OpenSRF wraps typed JSON objects in on the
//! wire: `{"__c": "<class>", "__p": <payload>}`.

const CLASS_KEY: &str = "__c";
const PAYLOAD_KEY: &str = "__p";

/// A JSON payload tagged with its OpenSRF class name.
pub struct ClassifiedJson {
    class: String,
    json: json::JsonValue,
}

fn looks_classified(obj: &json::JsonValue) -> bool {
    obj.is_object() && obj[CLASS_KEY].is_string() && obj.has_key(PAYLOAD_KEY)
}

impl ClassifiedJson {
    pub fn json(&self) -> &json::JsonValue {
        &self.json
    }

    /// Takes ownership of the wrapped value, leaving `JsonValue::Null` in
    /// its place.
    pub fn take_json(&mut self) -> json::JsonValue {
        std::mem::replace(&mut self.json, json::JsonValue::Null)
    }

    pub fn class(&self) -> &str {
        self.class.as_str()
    }

    /// Wraps `json` in a `{__c, __p}` object tagged with `class`. Does
    /// not recurse into nested values.
    ///
    /// ```
    /// let obj = json::array![1,2,3];
    /// let obj = ferrosrf::classified::ClassifiedJson::classify(obj, "abc");
    /// assert_eq!(obj["__c"].as_str().unwrap(), "abc");
    /// assert_eq!(obj["__p"][1].as_u8().unwrap(), 2u8);
    /// ```
    pub fn classify(json: json::JsonValue, class: &str) -> json::JsonValue {
        let mut wrapper = json::JsonValue::new_object();
        wrapper[CLASS_KEY] = class.into();
        wrapper[PAYLOAD_KEY] = json;
        wrapper
    }

    pub fn can_declassify(obj: &json::JsonValue) -> bool {
        looks_classified(obj)
    }

    /// Unwraps a `{__c, __p}` object into its class name and payload, if
    /// it has that shape. Does not recurse into nested values.
    ///
    /// ```
    /// let obj = json::object! {__c: "abc", __p: [1,2,3]};
    /// let value_op = ferrosrf::classified::ClassifiedJson::declassify(obj);
    /// assert!(value_op.is_some());
    /// let value = value_op.unwrap();
    /// assert_eq!(value.class(), "abc");
    /// assert_eq!(value.json()[1].as_u8().unwrap(), 2u8);
    /// ```
    pub fn declassify(mut obj: json::JsonValue) -> Option<ClassifiedJson> {
        if !looks_classified(&obj) {
            return None;
        }

        let class = obj[CLASS_KEY].as_str()?.to_string();
        let json = obj[PAYLOAD_KEY].take();

        Some(ClassifiedJson { class, json })
    }
}
