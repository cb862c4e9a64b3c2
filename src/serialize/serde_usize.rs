//! Addresses as plain integers, both on the wire and at the API boundary.
//!
//! Every lookup in the tracker is by address, so anything pointer-shaped the
//! caller holds (`*const T`, `*mut T`, `NonNull<T>`, `Option<NonNull<T>>`)
//! is accepted through [`AsUsize`]. The same trait drives the
//! `#[serde(with = "serde_usize")]` helpers used by report snapshots.

use std::{marker::PhantomData, ptr::NonNull};

use serde::{de::Visitor, Deserializer, Serializer};

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

pub trait FromUsize: Copy {
    fn from_usize(value: usize) -> Self;
}

impl AsUsize for usize {
    fn as_usize(self) -> usize {
        self
    }
}

impl<T: ?Sized> AsUsize for *const T {
    fn as_usize(self) -> usize {
        self.cast::<u8>() as usize
    }
}

impl<T: ?Sized> AsUsize for *mut T {
    fn as_usize(self) -> usize {
        self.cast::<u8>() as usize
    }
}

impl<T: ?Sized> AsUsize for NonNull<T> {
    fn as_usize(self) -> usize {
        self.as_ptr().as_usize()
    }
}

/// `None` is the null address.
impl<T: ?Sized> AsUsize for Option<NonNull<T>> {
    fn as_usize(self) -> usize {
        self.map_or(0, AsUsize::as_usize)
    }
}

impl<T> FromUsize for *const T {
    fn from_usize(value: usize) -> Self {
        value as Self
    }
}

impl FromUsize for usize {
    fn from_usize(value: usize) -> Self {
        value
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Copy + AsUsize,
{
    let value = (*value).as_usize();
    serializer.serialize_u64(value as u64)
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromUsize,
{
    struct V<Ptr>(PhantomData<Ptr>);

    impl<'de, Ptr> Visitor<'de> for V<Ptr>
    where
        Ptr: FromUsize,
    {
        type Value = Ptr;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an address")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            usize::try_from(v)
                .map(Ptr::from_usize)
                .map_err(|_| E::custom("address does not fit in usize"))
        }
    }

    deserializer.deserialize_u64(V::<T>(PhantomData))
}
