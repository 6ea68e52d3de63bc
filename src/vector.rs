use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Pure function from dimension index to element value.
pub type Generator = Arc<dyn Fn(usize) -> f64 + Send + Sync>;

/// Fallback element function: `exp(-d/10) * sin(d)`.
pub fn fallback_element(dimension: usize) -> f64 {
    let d = dimension as f64;
    (-d / 10.0).exp() * d.sin()
}

pub fn default_generator() -> Generator {
    Arc::new(fallback_element)
}

/// Unbounded, memoized sequence of reals defined by a generator.
///
/// The cache is a dense arena indexed by dimension. Its length is the
/// watermark of the highest dimension ever requested; it only grows and a
/// computed element never changes. Clones share both the generator and
/// the cache.
#[derive(Clone, Default)]
pub struct LazyVector {
    generator: Option<Generator>,
    cache: Arc<Mutex<Vec<f64>>>,
}

impl LazyVector {
    pub fn new<F>(generator: F) -> Self
    where
        F: Fn(usize) -> f64 + Send + Sync + 'static,
    {
        Self::from_generator(Arc::new(generator))
    }

    pub fn from_generator(generator: Generator) -> Self {
        Self {
            generator: Some(generator),
            cache: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Builds a vector from a materialized window. Dimensions past the
    /// window read as `0.0`.
    pub fn from_elements(elements: Vec<f64>) -> Self {
        let window: Arc<[f64]> = elements.clone().into();
        Self {
            generator: Some(Arc::new(move |d| window.get(d).copied().unwrap_or(0.0))),
            cache: Arc::new(Mutex::new(elements)),
        }
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Assigns the fallback generator if none was supplied.
    pub fn with_default_generator(mut self) -> Self {
        if self.generator.is_none() {
            self.generator = Some(default_generator());
        }
        self
    }

    /// Returns the element at `dimension`, computing every missing index
    /// up to it in ascending order.
    pub fn get_element(&self, dimension: usize) -> f64 {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        self.extend(&mut cache, dimension + 1);
        cache[dimension]
    }

    /// First `n` elements. Grows the cache once, under a single lock.
    pub fn window(&self, n: usize) -> Vec<f64> {
        if n == 0 {
            return Vec::new();
        }
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        self.extend(&mut cache, n);
        cache[..n].to_vec()
    }

    /// Number of elements computed so far.
    pub fn computed(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn extend(&self, cache: &mut Vec<f64>, len: usize) {
        while cache.len() < len {
            let next = cache.len();
            let value = match &self.generator {
                Some(generator) => generator(next),
                None => fallback_element(next),
            };
            cache.push(value);
        }
    }
}

impl fmt::Debug for LazyVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyVector")
        .field("has_generator", &self.has_generator())
        .field("computed", &self.computed())
        .finish()
    }
}

/// Pearson correlation over the first `n` elements.
///
/// Zero-variance windows (constant vectors, `n == 0`) and non-finite
/// results yield `0.0`.
pub fn similarity(a: &LazyVector, b: &LazyVector, n: usize) -> f64 {
    let xs = a.window(n);
    let ys = b.window(n);

    let (mut sum_xy, mut sum_x, mut sum_y, mut sum_x2, mut sum_y2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys.iter()) {
        sum_xy += x * y;
        sum_x += x;
        sum_y += y;
        sum_x2 += x * x;
        sum_y2 += y * y;
    }

    let n = n as f64;
    let numerator = n * sum_xy - sum_x * sum_y;
    let denominator = ((n * sum_x2 - sum_x * sum_x) * (n * sum_y2 - sum_y * sum_y)).sqrt();

    if denominator == 0.0 {
        return 0.0;
    }
    let r = numerator / denominator;
    if !r.is_finite() {
        return 0.0;
    }
    r.clamp(-1.0, 1.0)
}
