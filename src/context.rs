use std::collections::HashMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::value::AttributeValue;

const CONTEXT_CUSTOM_STARTING_CAPACITY: usize = 10;
const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f64 = BUCKET_SCALE_INT as f64;

/// A Context holds the attributes of the entity a flag is being evaluated for: a user, a device,
/// an organization, or anything else the application wants to target.
///
/// The only mandatory property is the key, which must uniquely identify the entity. A context
/// with an empty key is considered invalid and cannot be evaluated.
///
/// Besides the key, a context may carry a name, an anonymous marker, and any number of custom
/// attributes. To construct a Context, use the [ContextBuilder] returned by [Context::with_key].
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, AttributeValue>,
}

#[derive(Clone, Copy)]
pub(crate) enum BucketPrefix<'a> {
    KeyAndSalt(&'a str, &'a str),
    Seed(i64),
}

impl<'a> BucketPrefix<'a> {
    fn write_hash(&self, hash: &mut Sha1) {
        match self {
            BucketPrefix::KeyAndSalt(key, salt) => {
                hash.update(key.as_bytes());
                hash.update(b".");
                hash.update(salt.as_bytes());
            }
            BucketPrefix::Seed(seed) => {
                let seed_str = seed.to_string();
                hash.update(seed_str.as_bytes());
            }
        }
    }
}

impl Context {
    /// Create a new [ContextBuilder], seeding it with the provided key.
    pub fn with_key(key: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(key)
    }

    /// Returns the key of the context.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the name of the context, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns true if the context was marked anonymous.
    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// A context can be evaluated only if it has a non-empty key.
    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
    }

    /// Return the value of the attribute named `attr`.
    ///
    /// `attr` is either a plain attribute name, or a slash-delimited path such as
    /// `/address/city` that descends into object-valued attributes. In a path, `~1` stands for
    /// `/` and `~0` for `~`.
    pub fn value_of(&self, attr: &str) -> Option<AttributeValue> {
        if !attr.starts_with('/') {
            return self.top_level_value(attr);
        }

        let mut components = attr[1..].split('/').map(unescape_path_component);
        let first = components.next()?;
        let mut value = self.top_level_value(&first)?;
        for component in components {
            value = value.get(&component)?.clone();
        }
        Some(value)
    }

    fn top_level_value(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "" => None,
            "key" => Some(AttributeValue::String(self.key.clone())),
            "name" => self.name.clone().map(AttributeValue::String),
            "anonymous" => Some(AttributeValue::Bool(self.anonymous)),
            _ => self.attributes.get(name).cloned(),
        }
    }

    /// Computes the bucket, a number in `[0, 1)`, used for percentage rollouts.
    ///
    /// The attribute `by_attr` (the key when None) must hold a string or an integer; any other
    /// value, or a missing attribute, puts the context in bucket 0.
    pub(crate) fn bucket(&self, by_attr: Option<&str>, prefix: BucketPrefix) -> f64 {
        let attr_value = match by_attr {
            Some(attr) => self.value_of(attr),
            None => Some(AttributeValue::String(self.key.clone())),
        };
        Self::bucket_value(attr_value.as_ref(), prefix).unwrap_or(0.0)
    }

    fn bucket_value(attr_value: Option<&AttributeValue>, prefix: BucketPrefix) -> Option<f64> {
        let id = attr_value?.as_bucketable()?;

        let mut hash = Sha1::new();
        prefix.write_hash(&mut hash);
        hash.update(b".");
        hash.update(id.as_bytes());

        let digest = hash.finalize();
        let hexhash = base16ct::lower::encode_string(&digest);

        let hexhash_15 = &hexhash[..15]; // yes, 15 chars, not 16
        let numhash = i64::from_str_radix(hexhash_15, 16).ok()?;

        Some(numhash as f64 / BUCKET_SCALE)
    }
}

fn unescape_path_component(component: &str) -> String {
    component.replace("~1", "/").replace("~0", "~")
}

impl Serialize for Context {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("key", &self.key)?;
        if let Some(name) = &self.name {
            map.serialize_entry("name", name)?;
        }
        if self.anonymous {
            map.serialize_entry("anonymous", &true)?;
        }
        let mut custom: Vec<_> = self.attributes.iter().collect();
        custom.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in custom {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            key: String,
            #[serde(default)]
            name: Option<String>,
            #[serde(default, deserialize_with = "deserialize_null_default")]
            anonymous: bool,
            #[serde(flatten)]
            attributes: HashMap<String, AttributeValue>,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(Context {
            key: raw.key,
            name: raw.name,
            anonymous: raw.anonymous,
            attributes: raw.attributes,
        })
    }
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Contains methods for configuring a [Context].
pub struct ContextBuilder {
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, AttributeValue>,
}

impl ContextBuilder {
    /// Create a new context builder, setting the key to `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::with_capacity(CONTEXT_CUSTOM_STARTING_CAPACITY),
        }
    }

    /// Replace the key.
    pub fn key(&mut self, key: impl Into<String>) -> &mut Self {
        self.key = key.into();
        self
    }

    /// Set the name attribute for this builder instance.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Set the anonymous attribute for this builder instance.
    pub fn anonymous(&mut self, anonymous: bool) -> &mut Self {
        self.anonymous = anonymous;
        self
    }

    /// Set a custom attribute. The built-in names `key`, `name` and `anonymous` are routed to
    /// their setters when the value has the right type, and ignored otherwise.
    pub fn set_value(&mut self, attribute_name: &str, value: AttributeValue) -> &mut Self {
        match (attribute_name, value) {
            ("key", AttributeValue::String(s)) => self.key = s,
            ("name", AttributeValue::String(s)) => self.name = Some(s),
            ("anonymous", AttributeValue::Bool(b)) => self.anonymous = b,
            ("key" | "name" | "anonymous" | "", _) => {
                log::warn!("ignoring invalid value for attribute '{}'", attribute_name)
            }
            (_, value) => {
                self.attributes.insert(attribute_name.to_string(), value);
            }
        }
        self
    }

    /// Set several custom attributes at once.
    pub fn custom(&mut self, custom: HashMap<String, AttributeValue>) -> &mut Self {
        for (k, v) in custom {
            self.set_value(&k, v);
        }
        self
    }

    /// Create a new [Context] instance.
    pub fn build(&self) -> Context {
        Context {
            key: self.key.clone(),
            name: self.name.clone(),
            anonymous: self.anonymous,
            attributes: self.attributes.clone(),
        }
    }
}
