use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use vmstor::pool::PoolInfo;
use vmstor::tools::{ObjectSnapshot, ObjectStoreClient, ObjectStoreSession};
use vmstor_shared::errors::{VmstorError, VmstorResult};

const ENOENT: i32 = 2;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;

/// An image in the fake object store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeImage {
    pub size: u64,
    pub snapshots: Vec<ObjectSnapshot>,
    /// Clones per snapshot name.
    pub children: HashMap<String, Vec<String>>,
    /// `(image, snapshot)` this image was cloned from.
    pub parent: Option<(String, String)>,
}

type Images = Arc<Mutex<HashMap<String, FakeImage>>>;

fn key(image: &str) -> String {
    image.rsplit('/').next().unwrap_or(image).to_string()
}

/// Object store shared by every session it hands out.
///
/// Images are keyed by their last path segment, so `pool/image` and `image`
/// name the same image.
#[derive(Default)]
pub struct FakeObjectStore {
    images: Images,
    connects: Mutex<Vec<String>>,
}

impl FakeObjectStore {
    pub fn add_image(&self, name: &str, size: u64) {
        self.images.lock().insert(
            key(name),
            FakeImage {
                size,
                ..Default::default()
            },
        );
    }

    pub fn add_snapshot(&self, image: &str, snapshot: &str, protected: bool) {
        self.images
            .lock()
            .entry(key(image))
            .or_default()
            .snapshots
            .push(ObjectSnapshot {
                name: snapshot.to_string(),
                protected,
            });
    }

    /// Record `child` as a clone of `image@snapshot`.
    pub fn add_clone(&self, image: &str, snapshot: &str, child: &str) {
        let mut images = self.images.lock();
        images
            .entry(key(image))
            .or_default()
            .children
            .entry(snapshot.to_string())
            .or_default()
            .push(key(child));
        images.entry(key(child)).or_default().parent = Some((key(image), snapshot.to_string()));
    }

    pub fn image(&self, name: &str) -> Option<FakeImage> {
        self.images.lock().get(&key(name)).cloned()
    }

    /// Pool UUIDs of every session opened.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

impl ObjectStoreClient for FakeObjectStore {
    fn connect(&self, pool: &PoolInfo) -> VmstorResult<Box<dyn ObjectStoreSession>> {
        self.connects.lock().push(pool.uuid.clone());
        Ok(Box::new(FakeSession {
            images: self.images.clone(),
        }))
    }
}

struct FakeSession {
    images: Images,
}

fn backend(code: i32, message: String) -> VmstorError {
    VmstorError::Backend { code, message }
}

impl FakeSession {
    fn with_image<T>(&self, image: &str, f: impl FnOnce(&mut FakeImage) -> VmstorResult<T>) -> VmstorResult<T> {
        let mut images = self.images.lock();
        let entry = images
            .get_mut(&key(image))
            .ok_or_else(|| backend(ENOENT, format!("image {} not found", image)))?;
        f(entry)
    }
}

impl ObjectStoreSession for FakeSession {
    fn snapshot_create(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.with_image(image, |img| {
            if img.snapshots.iter().any(|s| s.name == snapshot) {
                return Err(backend(17, format!("snapshot {}@{} exists", image, snapshot)));
            }
            img.snapshots.push(ObjectSnapshot {
                name: snapshot.to_string(),
                protected: false,
            });
            Ok(())
        })
    }

    fn snapshot_list(&self, image: &str) -> VmstorResult<Vec<ObjectSnapshot>> {
        self.with_image(image, |img| Ok(img.snapshots.clone()))
    }

    fn snapshot_protect(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.with_image(image, |img| {
            let snap = img
                .snapshots
                .iter_mut()
                .find(|s| s.name == snapshot)
                .ok_or_else(|| backend(ENOENT, format!("snapshot {}@{} not found", image, snapshot)))?;
            snap.protected = true;
            Ok(())
        })
    }

    fn snapshot_unprotect(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.with_image(image, |img| {
            if img.children.get(snapshot).is_some_and(|c| !c.is_empty()) {
                return Err(backend(EBUSY, format!("snapshot {}@{} has children", image, snapshot)));
            }
            let snap = img
                .snapshots
                .iter_mut()
                .find(|s| s.name == snapshot)
                .ok_or_else(|| backend(ENOENT, format!("snapshot {}@{} not found", image, snapshot)))?;
            snap.protected = false;
            Ok(())
        })
    }

    fn snapshot_remove(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.with_image(image, |img| {
            let pos = img
                .snapshots
                .iter()
                .position(|s| s.name == snapshot)
                .ok_or_else(|| backend(ENOENT, format!("snapshot {}@{} not found", image, snapshot)))?;
            if img.snapshots[pos].protected {
                return Err(backend(EBUSY, format!("snapshot {}@{} is protected", image, snapshot)));
            }
            img.snapshots.remove(pos);
            img.children.remove(snapshot);
            Ok(())
        })
    }

    fn clone_snapshot(&self, image: &str, snapshot: &str, dest_image: &str) -> VmstorResult<()> {
        let size = self.with_image(image, |img| {
            let snap = img
                .snapshots
                .iter()
                .find(|s| s.name == snapshot)
                .ok_or_else(|| backend(ENOENT, format!("snapshot {}@{} not found", image, snapshot)))?;
            if !snap.protected {
                return Err(backend(EINVAL, format!("snapshot {}@{} is not protected", image, snapshot)));
            }
            img.children
                .entry(snapshot.to_string())
                .or_default()
                .push(key(dest_image));
            Ok(img.size)
        })?;

        self.images.lock().insert(
            key(dest_image),
            FakeImage {
                size,
                parent: Some((key(image), snapshot.to_string())),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn children(&self, image: &str, snapshot: &str) -> VmstorResult<Vec<String>> {
        self.with_image(image, |img| Ok(img.children.get(snapshot).cloned().unwrap_or_default()))
    }

    fn flatten(&self, image: &str) -> VmstorResult<()> {
        let parent = self.with_image(image, |img| Ok(img.parent.take()))?;
        if let Some((parent, snapshot)) = parent {
            if let Some(children) = self
                .images
                .lock()
                .get_mut(&parent)
                .and_then(|p| p.children.get_mut(&snapshot))
            {
                let image = key(image);
                children.retain(|c| *c != image);
            }
        }
        Ok(())
    }

    fn resize(&self, image: &str, size: u64) -> VmstorResult<()> {
        self.with_image(image, |img| {
            img.size = size;
            Ok(())
        })
    }
}
